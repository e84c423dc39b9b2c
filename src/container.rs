use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, info};
use zip::{CompressionMethod, ZipArchive};

use crate::error::{Error, Result};
use crate::http::HttpFile;
use crate::stream::{ReadSeek, SectionReader};

pub const PAYLOAD_ENTRY_NAME: &str = "payload.bin";

const ZIP_LOCAL_MAGIC: &[u8; 4] = b"PK\x03\x04";
const ZIP_LOCAL_HEADER_SIZE: usize = 30;

/// A seekable payload stream, whatever container it came from.
pub type PayloadStream = Box<dyn ReadSeek + Send>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerKind {
    /// OTA zip archive containing a `payload.bin` entry.
    Zip,
    /// Raw `payload.bin` on disk.
    Bin,
    /// Remote zip or raw payload served over HTTP(S).
    Url,
}

impl ContainerKind {
    /// Guess the kind of `input`: URLs by scheme, local files by their
    /// leading magic bytes.
    pub fn detect(input: &str) -> Result<Self> {
        if is_url(input) {
            return Ok(Self::Url);
        }

        let mut file = File::open(input)?;

        if has_zip_magic(&mut file)? {
            Ok(Self::Zip)
        } else {
            Ok(Self::Bin)
        }
    }
}

pub fn is_url(input: &str) -> bool {
    let lower = input.get(..8).unwrap_or(input).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Open `input` as a payload stream positioned anywhere; consumers seek.
pub fn open(kind: ContainerKind, input: &str) -> Result<PayloadStream> {
    match kind {
        ContainerKind::Bin => Ok(Box::new(open_local(Path::new(input))?)),
        ContainerKind::Zip => open_zip_entry(File::open(input)?, PAYLOAD_ENTRY_NAME),
        ContainerKind::Url => open_remote(input),
    }
}

pub fn open_local(path: &Path) -> Result<File> {
    Ok(File::open(path)?)
}

pub fn open_remote(url: &str) -> Result<PayloadStream> {
    open_http(HttpFile::open(url)?)
}

/// Wrap an opened remote file. The first bytes decide whether it is a zip
/// archive or a raw payload.
pub fn open_http(mut file: HttpFile) -> Result<PayloadStream> {
    if has_zip_magic(&mut file)? {
        debug!("{} is a zip archive", file.url());
        open_zip_entry(file, PAYLOAD_ENTRY_NAME)
    } else {
        debug!("{} is a raw payload", file.url());
        Ok(Box::new(file))
    }
}

/// Expose the first archive entry whose name ends with `suffix`.
///
/// Stored entries are served in place through a [`SectionReader`] over the
/// archive itself. Compressed entries are inflated once into an anonymous
/// temporary file, which is deleted when the returned stream is dropped.
pub fn open_zip_entry<R>(reader: R, suffix: &str) -> Result<PayloadStream>
where
    R: Read + Seek + Send + 'static,
{
    let mut archive = ZipArchive::new(reader)?;

    let name = archive
        .file_names()
        .find(|n| n.ends_with(suffix))
        .map(str::to_owned)
        .ok_or_else(|| Error::EntryNotFound(suffix.to_owned()))?;

    let (method, header_start, size) = {
        let entry = archive.by_name(&name)?;
        (entry.compression(), entry.header_start(), entry.size())
    };

    if method == CompressionMethod::Stored {
        let mut inner = archive.into_inner();
        let data_start = local_data_start(&mut inner, header_start)?;

        debug!("Entry {name} is stored at offset {data_start} ({size} bytes)");

        return Ok(Box::new(SectionReader::new(inner, data_start, size)?));
    }

    info!("Entry {name} is compressed ({method:?}); inflating to a temporary file");

    let mut spool = tempfile::tempfile()?;
    let copied = io::copy(&mut archive.by_name(&name)?, &mut spool)?;
    if copied != size {
        return Err(Error::MalformedContainer(format!(
            "entry {name} inflated to {copied} bytes, expected {size}",
        )));
    }
    spool.seek(SeekFrom::Start(0))?;

    Ok(Box::new(spool))
}

/// Offset of the first data byte of the entry whose local file header begins
/// at `header_start`. The local header's name and extra field lengths may
/// differ from those in the central directory.
fn local_data_start<R: Read + Seek>(reader: &mut R, header_start: u64) -> Result<u64> {
    let mut header = [0u8; ZIP_LOCAL_HEADER_SIZE];
    reader.seek(SeekFrom::Start(header_start))?;
    reader.read_exact(&mut header)?;

    if &header[..4] != ZIP_LOCAL_MAGIC {
        return Err(Error::MalformedContainer(format!(
            "invalid zip local file header at offset {header_start}",
        )));
    }

    let name_len = u16::from_le_bytes([header[26], header[27]]);
    let extra_len = u16::from_le_bytes([header[28], header[29]]);

    Ok(header_start + ZIP_LOCAL_HEADER_SIZE as u64 + u64::from(name_len) + u64::from(extra_len))
}

/// Check for a zip local file header at the start of `reader`, then rewind.
fn has_zip_magic<R: Read + Seek>(reader: &mut R) -> io::Result<bool> {
    let mut magic = [0u8; 4];
    let mut filled = 0;

    while filled < magic.len() {
        match reader.read(&mut magic[filled..])? {
            0 => break,
            n => filled += n,
        }
    }

    reader.seek(SeekFrom::Start(0))?;

    Ok(filled == magic.len() && &magic == ZIP_LOCAL_MAGIC)
}
