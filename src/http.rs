use std::io::{self, Read, Seek, SeekFrom};
use std::thread;
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, RANGE};
use tracing::{debug, warn};

use crate::error::{Error, Result};

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Attempts per read before a network failure is returned to the caller.
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Response of the ranged GET currently being consumed.
struct RangeStream {
    response: Response,
    start: u64,
    consumed: u64,
}

impl RangeStream {
    fn position(&self) -> u64 {
        self.start + self.consumed
    }
}

/// A remote file accessed through HTTP byte-range requests.
///
/// Seeking only moves a logical cursor. Reading opens a `Range: bytes=<pos>-`
/// request at the cursor and keeps streaming from it, so sequential reads
/// share one connection; a read after a non-contiguous seek replaces it.
pub struct HttpFile {
    client: Client,
    url: String,
    size: u64,
    pos: u64,
    stream: Option<RangeStream>,
    requests: u64,
    closed: bool,
}

impl HttpFile {
    pub fn open(url: &str) -> Result<Self> {
        // The blocking client's default 30s timeout covers the whole body,
        // which a long-lived range stream easily exceeds.
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(None)
            .build()?;

        Self::with_client(client, url)
    }

    /// Probe `url` with a HEAD request for its size and range support.
    pub fn with_client(client: Client, url: &str) -> Result<Self> {
        let response = client.head(url).send()?.error_for_status()?;
        let headers = response.headers();

        let ranges = headers
            .get(ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.split(',').any(|u| u.trim().eq_ignore_ascii_case("bytes")));
        if !ranges {
            return Err(Error::RangeNotSupported(url.to_owned()));
        }

        // Read the header directly: a HEAD response has no body, so the
        // client's own content length would be zero.
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&s| s > 0)
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("{url} did not report a content length"),
                ))
            })?;

        debug!("Remote file {url} is {size} bytes");

        Ok(Self {
            client,
            url: url.to_owned(),
            size,
            pos: 0,
            stream: None,
            requests: 0,
            closed: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of ranged GET requests issued so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Drop the open connection. Any later read or seek fails.
    pub fn close(&mut self) {
        self.stream = None;
        self.closed = true;
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::other("I/O operation on closed file"));
        }

        Ok(())
    }

    fn open_range(&mut self) -> io::Result<()> {
        self.stream = None;

        let response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-", self.pos))
            .send()
            .map_err(io::Error::other)?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            // A full response is only usable if it starts where we want.
            StatusCode::OK if self.pos == 0 => {}
            status => {
                return Err(io::Error::other(format!(
                    "range request at offset {} failed with status {status}",
                    self.pos,
                )));
            }
        }

        self.requests += 1;
        debug!("Opened range request #{} at offset {}", self.requests, self.pos);

        self.stream = Some(RangeStream {
            response,
            start: self.pos,
            consumed: 0,
        });

        Ok(())
    }

    fn read_once(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if !self.stream.as_ref().is_some_and(|s| s.position() == self.pos) {
            self.open_range()?;
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(io::Error::other("range stream is not open"));
        };

        let n = stream.response.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed at offset {} of {}", self.pos, self.size),
            ));
        }

        stream.consumed += n as u64;
        self.pos += n as u64;

        Ok(n)
    }
}

impl Read for HttpFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;

        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }

        let to_read = (self.size - self.pos).min(buf.len() as u64) as usize;
        let buf = &mut buf[..to_read];
        let mut attempt = 1;

        loop {
            match self.read_once(buf) {
                Ok(n) => return Ok(n),
                Err(e) if attempt < MAX_ATTEMPTS => {
                    warn!(
                        "Read of {} at offset {} failed (attempt {attempt}/{MAX_ATTEMPTS}): {e}",
                        self.url, self.pos,
                    );
                    self.stream = None;
                    thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(e) => {
                    self.stream = None;
                    return Err(e);
                }
            }
        }
    }
}

impl Seek for HttpFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_open()?;

        let new_pos = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::End(o) => self.size.checked_add_signed(o),
            SeekFrom::Current(o) => self.pos.checked_add_signed(o),
        };

        self.pos = new_pos.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the file",
            )
        })?;

        Ok(self.pos)
    }
}

impl Drop for HttpFile {
    fn drop(&mut self) {
        self.close();
    }
}
