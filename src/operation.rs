use std::fmt;
use std::io::Read;

use bzip2::read::BzDecoder;
use sha2::{Digest, Sha256};
use xz2::read::XzDecoder;

use crate::chromeos_update_engine::install_operation::Type;
use crate::chromeos_update_engine::{Extent, InstallOperation};
use crate::error::{Error, Result};

/// Frame magic of a zstd stream. `REPLACE_ZSTD` data without it is copied
/// verbatim, since some payloads mis-tag plain data.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// Cap on the up-front allocation for decompressed output. The buffer still
/// grows up to the destination size if the stream really is larger.
const MAX_PREALLOC: u64 = 64 * 1024 * 1024;

/// The operation types a full payload can be reconstructed from. Every other
/// tag, including known delta operations, is `Unsupported` and fails the
/// partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Replace,
    Zero,
    ReplaceBz,
    ReplaceXz,
    ReplaceZstd,
    Unsupported(i32),
}

impl OperationKind {
    pub fn of(op: &InstallOperation) -> Self {
        match Type::try_from(op.r#type) {
            Ok(Type::Replace) => Self::Replace,
            Ok(Type::Zero) => Self::Zero,
            Ok(Type::ReplaceBz) => Self::ReplaceBz,
            Ok(Type::ReplaceXz) => Self::ReplaceXz,
            Ok(Type::ReplaceZstd) => Self::ReplaceZstd,
            _ => Self::Unsupported(op.r#type),
        }
    }

    /// Whether the operation's blob bytes are needed to decode it.
    pub fn reads_data(self) -> bool {
        matches!(
            self,
            Self::Replace | Self::ReplaceBz | Self::ReplaceXz | Self::ReplaceZstd
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Replace => f.write_str("REPLACE"),
            Self::Zero => f.write_str("ZERO"),
            Self::ReplaceBz => f.write_str("REPLACE_BZ"),
            Self::ReplaceXz => f.write_str("REPLACE_XZ"),
            Self::ReplaceZstd => f.write_str("REPLACE_ZSTD"),
            Self::Unsupported(raw) => match Type::try_from(*raw) {
                Ok(t) => f.write_str(t.as_str_name()),
                Err(_) => write!(f, "unknown type {raw}"),
            },
        }
    }
}

/// Bytes destined for one absolute offset of an output image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkData {
    Bytes(Vec<u8>),
    /// A run of zeros, kept as a length so that large `ZERO` extents are
    /// never materialized.
    Zeros(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub offset: u64,
    pub data: ChunkData,
}

impl Chunk {
    pub fn bytes(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            data: ChunkData::Bytes(data),
        }
    }

    pub fn zeros(offset: u64, len: u64) -> Self {
        Self {
            offset,
            data: ChunkData::Zeros(len),
        }
    }

    pub fn len(&self) -> u64 {
        match &self.data {
            ChunkData::Bytes(b) => b.len() as u64,
            ChunkData::Zeros(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Byte offset and length of an extent.
pub fn extent_range(extent: &Extent, block_size: u64) -> Result<(u64, u64)> {
    let start_block = extent.start_block.ok_or(Error::MissingField("start_block"))?;
    let num_blocks = extent.num_blocks.ok_or(Error::MissingField("num_blocks"))?;

    let offset = start_block
        .checked_mul(block_size)
        .ok_or_else(|| Error::MalformedManifest(format!("extent start {start_block} overflows")))?;
    let len = num_blocks
        .checked_mul(block_size)
        .ok_or_else(|| Error::MalformedManifest(format!("extent length {num_blocks} overflows")))?;

    Ok((offset, len))
}

/// Byte offset one past the end of an extent.
pub fn extent_end(extent: &Extent, block_size: u64) -> Result<u64> {
    let (offset, len) = extent_range(extent, block_size)?;

    offset
        .checked_add(len)
        .ok_or_else(|| Error::MalformedManifest("extent end overflows".into()))
}

fn verify_sha256(data: &[u8], expected: &[u8]) -> Result<()> {
    let actual = Sha256::digest(data);
    if actual.as_slice() != expected {
        return Err(Error::HashMismatch {
            expected: hex::encode(expected),
            actual: hex::encode(actual),
        });
    }

    Ok(())
}

/// Decode at most one byte more than `limit`, which is enough for
/// [`scatter`] to reject oversized output without inflating all of it.
fn decompress(reader: impl Read, codec: &'static str, limit: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit.min(MAX_PREALLOC) as usize);
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|source| Error::DecodeError { codec, source })?;

    Ok(out)
}

/// Split `data` across the destination extents in order. The decoded length
/// must cover the extents exactly, allowing only the final block to be short.
fn scatter(data: Vec<u8>, extents: &[Extent], block_size: u64) -> Result<Vec<Chunk>> {
    let ranges = extents
        .iter()
        .map(|e| extent_range(e, block_size))
        .collect::<Result<Vec<_>>>()?;
    let Some(&(first_offset, _)) = ranges.first() else {
        return Err(Error::MissingField("dst_extents"));
    };

    let expected = ranges
        .iter()
        .fold(0u64, |acc, (_, len)| acc.saturating_add(*len));
    let actual = data.len() as u64;
    if actual.div_ceil(block_size) * block_size != expected {
        return Err(Error::ExtentMismatch { expected, actual });
    }

    if ranges.len() == 1 {
        return Ok(vec![Chunk::bytes(first_offset, data)]);
    }

    let mut chunks = Vec::with_capacity(ranges.len());
    let mut rest = data.as_slice();

    for (offset, len) in ranges {
        if rest.is_empty() {
            break;
        }

        let n = (len as usize).min(rest.len());
        chunks.push(Chunk::bytes(offset, rest[..n].to_vec()));
        rest = &rest[n..];
    }

    Ok(chunks)
}

/// Turn one operation and its raw blob bytes into positioned output chunks.
///
/// This is pure: it touches nothing but its arguments, so any number of
/// workers may call it at once. `data` must be exactly the operation's
/// `data_length` bytes (empty for `ZERO`). When `verify` is set and the
/// manifest records `data_sha256_hash`, the raw bytes are checked first.
pub fn decode_operation(
    op: &InstallOperation,
    data: Vec<u8>,
    block_size: u64,
    verify: bool,
) -> Result<Vec<Chunk>> {
    let kind = OperationKind::of(op);

    if verify && kind.reads_data() {
        if let Some(hash) = &op.data_sha256_hash {
            verify_sha256(&data, hash)?;
        }
    }

    let dst_len = op
        .dst_extents
        .iter()
        .filter_map(|e| e.num_blocks)
        .fold(0u64, |acc, n| acc.saturating_add(n.saturating_mul(block_size)));

    let decoded = match kind {
        OperationKind::Zero => {
            return op
                .dst_extents
                .iter()
                .map(|e| extent_range(e, block_size).map(|(offset, len)| Chunk::zeros(offset, len)))
                .collect();
        }
        OperationKind::Replace => data,
        OperationKind::ReplaceBz => decompress(BzDecoder::new(data.as_slice()), "bzip2", dst_len)?,
        OperationKind::ReplaceXz => decompress(XzDecoder::new(data.as_slice()), "xz", dst_len)?,
        OperationKind::ReplaceZstd => {
            if data.starts_with(&ZSTD_MAGIC) {
                let decoder = zstd::stream::read::Decoder::new(data.as_slice())
                    .map_err(|source| Error::DecodeError { codec: "zstd", source })?;
                decompress(decoder, "zstd", dst_len)?
            } else {
                data
            }
        }
        OperationKind::Unsupported(_) => {
            return Err(Error::UnsupportedOperation(kind.to_string()));
        }
    };

    scatter(decoded, &op.dst_extents, block_size)
}
