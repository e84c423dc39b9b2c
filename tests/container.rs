mod common;

use std::fs;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use assert_matches::assert_matches;
use reqwest::blocking::Client;
use tempfile::TempDir;
use zip::CompressionMethod;

use common::{Op, PayloadBuilder, pattern, zip_payload};
use payload_extract::container::{self, ContainerKind};
use payload_extract::http::HttpFile;
use payload_extract::{Error, ExtractOptions, NoopObserver, PayloadExtractor, PayloadStream};

/// Minimal HTTP/1.1 file server with optional byte-range support.
struct Server {
    url: String,
    gets: Arc<AtomicUsize>,
}

impl Server {
    fn start(data: Vec<u8>, ranges: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let data = Arc::new(data);
        let gets = Arc::new(AtomicUsize::new(0));

        {
            let gets = gets.clone();
            thread::spawn(move || {
                for stream in listener.incoming() {
                    let Ok(stream) = stream else { break };
                    let data = data.clone();
                    let gets = gets.clone();
                    thread::spawn(move || handle(stream, &data, ranges, &gets));
                }
            });
        }

        Self {
            url: format!("http://{addr}/ota.zip"),
            gets,
        }
    }

    fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn open(&self) -> payload_extract::Result<HttpFile> {
        HttpFile::with_client(client(), &self.url)
    }
}

fn client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}

fn handle(mut stream: TcpStream, data: &[u8], ranges: bool, gets: &AtomicUsize) {
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut request = String::new();
    if reader.read_line(&mut request).unwrap_or(0) == 0 {
        return;
    }

    let mut range_start = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            return;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("range") {
                range_start = value
                    .trim()
                    .strip_prefix("bytes=")
                    .and_then(|v| v.strip_suffix('-'))
                    .and_then(|v| v.parse::<usize>().ok());
            }
        }
    }

    let accept = if ranges { "Accept-Ranges: bytes\r\n" } else { "" };

    // Clients hang up mid-body whenever they seek away; ignore write errors.
    if request.starts_with("HEAD") {
        let _ = write!(
            stream,
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n{accept}Connection: close\r\n\r\n",
            data.len(),
        );
        return;
    }

    gets.fetch_add(1, Ordering::SeqCst);

    let (status, start) = match range_start {
        Some(start) if ranges => ("206 Partial Content", start.min(data.len())),
        _ => ("200 OK", 0),
    };
    let body = &data[start..];

    let _ = write!(
        stream,
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nContent-Range: bytes {start}-{}/{}\r\n{accept}Connection: close\r\n\r\n",
        body.len(),
        data.len().saturating_sub(1),
        data.len(),
    )
    .and_then(|_| stream.write_all(body));
}

fn sample_payload() -> (Vec<u8>, Vec<u8>) {
    let boot = pattern(3 * 4096, 42);
    let payload = PayloadBuilder::new()
        .partition_with_image("boot", vec![Op::xz(&boot, &[(0, 3)])], &boot)
        .partition("vendor_boot", vec![Op::zero(&[(0, 2)])])
        .build();

    (payload, boot)
}

fn extract_boot(stream: PayloadStream) -> Vec<u8> {
    let dir = TempDir::new().unwrap();
    let mut extractor = PayloadExtractor::new(stream, ExtractOptions::default()).unwrap();

    let outcomes = extractor
        .extract_all(&["boot".to_owned()], dir.path(), &NoopObserver)
        .unwrap();
    assert!(outcomes[0].result.as_ref().unwrap().verified);

    fs::read(dir.path().join("boot.img")).unwrap()
}

#[test]
fn local_inputs_are_detected() {
    let (payload, _) = sample_payload();
    let dir = TempDir::new().unwrap();

    let bin = dir.path().join("payload.bin");
    fs::write(&bin, &payload).unwrap();
    let zip = dir.path().join("ota.zip");
    fs::write(&zip, zip_payload(&payload, CompressionMethod::Stored)).unwrap();

    assert_eq!(ContainerKind::detect(bin.to_str().unwrap()).unwrap(), ContainerKind::Bin);
    assert_eq!(ContainerKind::detect(zip.to_str().unwrap()).unwrap(), ContainerKind::Zip);
    assert_eq!(
        ContainerKind::detect("https://dl.example.com/ota.zip").unwrap(),
        ContainerKind::Url
    );
}

#[test]
fn local_bin_and_zip_extract_identically() {
    let (payload, boot) = sample_payload();
    let dir = TempDir::new().unwrap();

    let bin = dir.path().join("payload.bin");
    fs::write(&bin, &payload).unwrap();
    let stored = dir.path().join("stored.zip");
    fs::write(&stored, zip_payload(&payload, CompressionMethod::Stored)).unwrap();
    let deflated = dir.path().join("deflated.zip");
    fs::write(&deflated, zip_payload(&payload, CompressionMethod::Deflated)).unwrap();

    for (kind, path) in [
        (ContainerKind::Bin, bin),
        (ContainerKind::Zip, stored),
        (ContainerKind::Zip, deflated),
    ] {
        let stream = container::open(kind, path.to_str().unwrap()).unwrap();
        assert_eq!(extract_boot(stream), boot);
    }
}

#[test]
fn zip_without_payload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ota.zip");

    let mut writer = zip::ZipWriter::new(fs::File::create(&path).unwrap());
    writer
        .start_file("boot.img", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"not a payload").unwrap();
    writer.finish().unwrap();

    let result = container::open(ContainerKind::Zip, path.to_str().unwrap());
    assert_matches!(result.map(|_| ()), Err(Error::EntryNotFound(_)));
}

#[test]
fn http_file_reads_ranges() {
    let data = pattern(100_000, 7);
    let server = Server::start(data.clone(), true);
    let mut file = server.open().unwrap();
    assert_eq!(file.len(), 100_000);
    assert_eq!(file.requests(), 0);

    let mut buf = vec![0; 1000];
    file.read_exact(&mut buf).unwrap();
    assert_eq!(buf, data[..1000]);
    file.read_exact(&mut buf).unwrap();
    assert_eq!(buf, data[1000..2000]);
    // Contiguous reads stay on one response.
    assert_eq!(file.requests(), 1);

    file.seek(SeekFrom::Start(50_000)).unwrap();
    file.read_exact(&mut buf[..10]).unwrap();
    assert_eq!(buf[..10], data[50_000..50_010]);
    assert_eq!(file.requests(), 2);

    assert_eq!(file.seek(SeekFrom::End(-10)).unwrap(), 99_990);
    let mut tail = Vec::new();
    file.read_to_end(&mut tail).unwrap();
    assert_eq!(tail, data[99_990..]);

    assert_eq!(file.read(&mut buf).unwrap(), 0);
    assert!(file.seek(SeekFrom::Current(-200_000)).is_err());
    assert_eq!(server.gets(), 3);
}

#[test]
fn closed_http_file_refuses_io() {
    let server = Server::start(pattern(1000, 1), true);
    let mut file = server.open().unwrap();

    assert!(!file.is_closed());
    file.close();
    assert!(file.is_closed());

    let mut buf = [0; 16];
    assert!(file.read(&mut buf).is_err());
    assert!(file.seek(SeekFrom::Start(0)).is_err());
}

#[test]
fn server_without_range_support_is_rejected() {
    let server = Server::start(pattern(1000, 1), false);

    assert_matches!(server.open().map(|_| ()), Err(Error::RangeNotSupported(_)));
}

#[test]
fn remote_zip_and_payload_extract() {
    let (payload, boot) = sample_payload();

    for data in [
        payload.clone(),
        zip_payload(&payload, CompressionMethod::Stored),
        zip_payload(&payload, CompressionMethod::Deflated),
    ] {
        let server = Server::start(data, true);
        let stream = container::open_http(server.open().unwrap()).unwrap();
        assert_eq!(extract_boot(stream), boot);
    }
}
