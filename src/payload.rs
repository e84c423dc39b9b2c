use std::io::{Read, Seek, SeekFrom};

use nom::{
    IResult,
    bytes::complete::tag,
    number::complete::{be_u32, be_u64},
};
use prost::Message;
use tracing::warn;

use crate::chromeos_update_engine::{DeltaArchiveManifest, PartitionUpdate};
use crate::error::{Error, Result};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Size of the fixed part of the header that every version carries.
const BASE_HEADER_SIZE: usize = PAYLOAD_MAGIC.len() + 8 + 8;

/// Full header size for version 2 payloads, which carry the metadata
/// signature size.
pub const PAYLOAD_HEADER_SIZE: usize = BASE_HEADER_SIZE + 4;

pub const SUPPORTED_VERSION: u64 = 2;

/// Minor versions of full payloads. Anything else describes a delta payload.
pub const SUPPORTED_MINOR_VERSIONS: [u32; 2] = [0, 8];

/// Refuse to buffer manifests larger than this. Real manifests are a few MiB.
const MAX_MANIFEST_SIZE: u64 = 256 * 1024 * 1024;

/// Fixed-size, big-endian header at offset 0 of a payload.
///
/// The binary format is:
/// - Magic bytes: "CrAU" (4 bytes)
/// - File format version (8 bytes, big-endian)
/// - Manifest size (8 bytes, big-endian)
/// - [Optional] Metadata signature size (4 bytes, big-endian, only if version >= 2)
/// - Manifest data (variable length, protobuf serialized)
/// - [Optional] Metadata signature (variable length, only if version >= 2)
/// - Operation data blobs (remaining bytes)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawHeader {
    pub file_format_version: u64,
    pub manifest_size: u64,
    pub metadata_signature_size: Option<u32>,
}

impl RawHeader {
    fn parse_base(input: &[u8]) -> IResult<&[u8], (u64, u64)> {
        let (input, _) = tag(&PAYLOAD_MAGIC[..])(input)?;
        let (input, file_format_version) = be_u64(input)?;
        let (input, manifest_size) = be_u64(input)?;

        Ok((input, (file_format_version, manifest_size)))
    }

    /// Read the header from the start of `reader`. Only the signature size
    /// field is conditional on the version, so a version 1 header is four
    /// bytes shorter.
    pub fn from_reader(mut reader: impl Read) -> Result<Self> {
        let mut base = [0u8; BASE_HEADER_SIZE];
        reader
            .read_exact(&mut base)
            .map_err(|e| Error::MalformedContainer(format!("truncated header: {e}")))?;

        let (file_format_version, manifest_size) = match Self::parse_base(&base) {
            Ok((_, fields)) => fields,
            Err(_) => {
                return Err(Error::MalformedContainer(format!(
                    "invalid magic: expected {:?}, got {:?}",
                    String::from_utf8_lossy(PAYLOAD_MAGIC),
                    String::from_utf8_lossy(&base[..PAYLOAD_MAGIC.len()]),
                )));
            }
        };

        let metadata_signature_size = if file_format_version > 1 {
            let mut size = [0u8; 4];
            reader
                .read_exact(&mut size)
                .map_err(|e| Error::MalformedContainer(format!("truncated header: {e}")))?;
            let (_, size) = be_u32::<_, nom::error::Error<&[u8]>>(&size[..])
                .map_err(|e| Error::MalformedContainer(e.to_string()))?;
            Some(size)
        } else {
            None
        };

        Ok(Self {
            file_format_version,
            manifest_size,
            metadata_signature_size,
        })
    }

    /// Encoded size of this header in bytes.
    pub fn header_size(&self) -> usize {
        if self.metadata_signature_size.is_some() {
            PAYLOAD_HEADER_SIZE
        } else {
            BASE_HEADER_SIZE
        }
    }
}

/// Parsed header and manifest of a payload, plus the absolute offset of the
/// data blob region that every operation's `data_offset` is relative to.
#[derive(Clone, Debug)]
pub struct PayloadHeader {
    pub raw: RawHeader,
    pub manifest: DeltaArchiveManifest,
    pub blob_offset: u64,
}

impl PayloadHeader {
    /// Parse the header from a payload stream positioned at offset 0. After
    /// this function returns, the stream is positioned at `blob_offset`.
    ///
    /// `allow_unknown_version` downgrades a format version other than 2 to a
    /// warning.
    pub fn from_reader<R: Read + Seek + ?Sized>(
        reader: &mut R,
        allow_unknown_version: bool,
    ) -> Result<Self> {
        let raw = RawHeader::from_reader(&mut *reader)?;

        if raw.file_format_version != SUPPORTED_VERSION {
            if !allow_unknown_version {
                return Err(Error::UnsupportedVersion(raw.file_format_version));
            }
            warn!(
                "Payload version is {} != {SUPPORTED_VERSION} and may be unsupported",
                raw.file_format_version,
            );
        }

        if raw.manifest_size == 0 {
            return Err(Error::MalformedContainer("manifest size is zero".into()));
        }
        if raw.manifest_size > MAX_MANIFEST_SIZE {
            return Err(Error::MalformedContainer(format!(
                "manifest size {} exceeds limit of {MAX_MANIFEST_SIZE} bytes",
                raw.manifest_size,
            )));
        }

        let mut manifest_raw = Vec::with_capacity(raw.manifest_size as usize);
        (&mut *reader)
            .take(raw.manifest_size)
            .read_to_end(&mut manifest_raw)?;
        if manifest_raw.len() as u64 != raw.manifest_size {
            return Err(Error::MalformedContainer(format!(
                "manifest truncated: expected {} bytes, got {}",
                raw.manifest_size,
                manifest_raw.len(),
            )));
        }

        let manifest = DeltaArchiveManifest::decode(manifest_raw.as_slice())
            .map_err(|e| Error::MalformedManifest(e.to_string()))?;

        let minor_version = manifest.minor_version();
        if !SUPPORTED_MINOR_VERSIONS.contains(&minor_version) {
            return Err(Error::UnsupportedMinorVersion(minor_version));
        }
        if manifest.block_size() == 0 {
            return Err(Error::MalformedManifest("block size is zero".into()));
        }

        // The metadata signature is skipped, not verified.
        match raw.metadata_signature_size {
            Some(0) => warn!("Payload metadata is not signed"),
            Some(size) => {
                reader.seek(SeekFrom::Current(size.into()))?;
            }
            None => {}
        }

        let blob_offset = reader.stream_position()?;

        Ok(Self {
            raw,
            manifest,
            blob_offset,
        })
    }

    pub fn block_size(&self) -> u64 {
        self.manifest.block_size().into()
    }

    pub fn partitions(&self) -> &[PartitionUpdate] {
        &self.manifest.partitions
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionUpdate> {
        self.manifest
            .partitions
            .iter()
            .find(|p| p.partition_name == name)
    }

    /// A full payload carries no source partition information.
    pub fn is_full_ota(&self) -> bool {
        self.manifest
            .partitions
            .iter()
            .all(|p| p.old_partition_info.is_none())
    }
}
