use std::io::{self, Read, Seek, SeekFrom, Write};

/// Shared buffer for writing runs of zeros without allocating.
pub(crate) static ZEROS: [u8; 64 * 1024] = [0u8; 64 * 1024];

/// Object-safe stand-in for `dyn Read + Seek`.
pub trait ReadSeek: Read + Seek {}

impl<R: Read + Seek> ReadSeek for R {}

/// A seekable view over `[start, start + size)` of another stream.
///
/// Positions reported by [`Seek`] are relative to `start`, so the section
/// behaves like a standalone file. This is how a stored zip member is exposed
/// without copying it out of the archive.
pub struct SectionReader<R> {
    inner: R,
    start: u64,
    size: u64,
    pos: u64,
}

impl<R: Read + Seek> SectionReader<R> {
    pub fn new(mut inner: R, start: u64, size: u64) -> io::Result<Self> {
        inner.seek(SeekFrom::Start(start))?;

        Ok(Self {
            inner,
            start,
            size,
            pos: 0,
        })
    }

    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> Read for SectionReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let to_read = self.size.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        if to_read == 0 {
            return Ok(0);
        }

        let n = self.inner.read(&mut buf[..to_read])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for SectionReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(o) => (0, o as i128),
            SeekFrom::End(o) => (self.size, o as i128),
            SeekFrom::Current(o) => (self.pos, o as i128),
        };

        let new_pos = base as i128 + offset;
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the section",
            ));
        }

        let new_pos = u64::try_from(new_pos)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Offset overflows u64"))?;
        self.inner.seek(SeekFrom::Start(self.start + new_pos))?;
        self.pos = new_pos;

        Ok(self.pos)
    }
}

/// Write `size` zero bytes to `writer`.
pub(crate) fn write_zeros(mut writer: impl Write, size: u64) -> io::Result<()> {
    let mut remaining = size;

    while remaining > 0 {
        let n = remaining.min(ZEROS.len() as u64) as usize;
        writer.write_all(&ZEROS[..n])?;
        remaining -= n as u64;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn section_reader_is_bounded() {
        let data: Vec<u8> = (0u8..32).collect();
        let mut section = SectionReader::new(Cursor::new(data), 8, 8).unwrap();

        let mut buf = Vec::new();
        section.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, (8u8..16).collect::<Vec<_>>());

        assert_eq!(section.seek(SeekFrom::End(-2)).unwrap(), 6);
        let mut tail = [0u8; 4];
        assert_eq!(section.read(&mut tail).unwrap(), 2);
        assert_eq!(&tail[..2], &[14, 15]);

        assert!(section.seek(SeekFrom::Current(-20)).is_err());
        assert_eq!(section.stream_position().unwrap(), 8);
    }

    #[test]
    fn zeros_longer_than_buffer() {
        let mut out = Vec::new();
        write_zeros(&mut out, ZEROS.len() as u64 * 2 + 3).unwrap();
        assert_eq!(out.len(), ZEROS.len() * 2 + 3);
        assert!(out.iter().all(|&b| b == 0));
    }
}
