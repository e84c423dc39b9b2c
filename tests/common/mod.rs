#![allow(dead_code)]

use std::io::{Cursor, Write};

use bzip2::Compression;
use bzip2::write::BzEncoder;
use prost::Message;
use sha2::{Digest, Sha256};
use xz2::write::XzEncoder;

use payload_extract::chromeos_update_engine::install_operation::Type;
use payload_extract::chromeos_update_engine::{
    DeltaArchiveManifest, Extent, InstallOperation, PartitionInfo, PartitionUpdate,
};

pub const BLOCK_SIZE: u32 = 4096;

pub fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

pub fn bzip2(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut encoder = XzEncoder::new(Vec::new(), 6);
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn zstd(data: &[u8]) -> Vec<u8> {
    zstd::encode_all(Cursor::new(data), 3).unwrap()
}

/// Deterministic, poorly compressible filler.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    let mut state = u32::from(seed) | 0x9e37_0000;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state as u8
        })
        .collect()
}

/// One operation of a synthetic partition: its type, the bytes stored in
/// the blob region and its destination extents as `(start_block, num_blocks)`.
#[derive(Clone)]
pub struct Op {
    pub kind: i32,
    pub data: Vec<u8>,
    pub dst: Vec<(u64, u64)>,
}

impl Op {
    pub fn new(kind: Type, data: Vec<u8>, dst: &[(u64, u64)]) -> Self {
        Self::raw(kind as i32, data, dst)
    }

    pub fn raw(kind: i32, data: Vec<u8>, dst: &[(u64, u64)]) -> Self {
        Self {
            kind,
            data,
            dst: dst.to_vec(),
        }
    }

    pub fn replace(data: &[u8], dst: &[(u64, u64)]) -> Self {
        Self::new(Type::Replace, data.to_vec(), dst)
    }

    pub fn zero(dst: &[(u64, u64)]) -> Self {
        Self::new(Type::Zero, Vec::new(), dst)
    }

    pub fn bz(plain: &[u8], dst: &[(u64, u64)]) -> Self {
        Self::new(Type::ReplaceBz, bzip2(plain), dst)
    }

    pub fn xz(plain: &[u8], dst: &[(u64, u64)]) -> Self {
        Self::new(Type::ReplaceXz, xz(plain), dst)
    }

    pub fn zstd(plain: &[u8], dst: &[(u64, u64)]) -> Self {
        Self::new(Type::ReplaceZstd, zstd(plain), dst)
    }
}

struct Partition {
    name: String,
    ops: Vec<Op>,
    info: Option<PartitionInfo>,
}

/// Assembles a complete payload.bin in memory.
pub struct PayloadBuilder {
    version: u64,
    block_size: u32,
    minor_version: u32,
    metadata_signature: Vec<u8>,
    hash_operations: bool,
    reverse_blobs: bool,
    partitions: Vec<Partition>,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self {
            version: 2,
            block_size: BLOCK_SIZE,
            minor_version: 0,
            metadata_signature: vec![0xa5; 32],
            hash_operations: true,
            reverse_blobs: false,
            partitions: Vec::new(),
        }
    }
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn minor_version(mut self, minor_version: u32) -> Self {
        self.minor_version = minor_version;
        self
    }

    pub fn metadata_signature(mut self, signature: Vec<u8>) -> Self {
        self.metadata_signature = signature;
        self
    }

    pub fn hash_operations(mut self, enabled: bool) -> Self {
        self.hash_operations = enabled;
        self
    }

    /// Lay out operation blobs in reverse manifest order.
    pub fn reverse_blobs(mut self) -> Self {
        self.reverse_blobs = true;
        self
    }

    pub fn partition(mut self, name: &str, ops: Vec<Op>) -> Self {
        self.partitions.push(Partition {
            name: name.to_owned(),
            ops,
            info: None,
        });
        self
    }

    /// Add a partition whose manifest records the size and hash of `image`.
    pub fn partition_with_image(mut self, name: &str, ops: Vec<Op>, image: &[u8]) -> Self {
        self.partitions.push(Partition {
            name: name.to_owned(),
            ops,
            info: Some(PartitionInfo {
                size: Some(image.len() as u64),
                hash: Some(sha256(image)),
            }),
        });
        self
    }

    pub fn manifest(&self) -> (DeltaArchiveManifest, Vec<u8>) {
        let mut blob = Vec::new();
        let mut partitions = Vec::new();

        let mut all_ops: Vec<(usize, usize)> = self
            .partitions
            .iter()
            .enumerate()
            .flat_map(|(p, partition)| (0..partition.ops.len()).map(move |o| (p, o)))
            .collect();
        if self.reverse_blobs {
            all_ops.reverse();
        }

        let mut placements = vec![Vec::new(); self.partitions.len()];
        for (p, partition) in self.partitions.iter().enumerate() {
            placements[p] = vec![None; partition.ops.len()];
        }
        for (p, o) in all_ops {
            let data = &self.partitions[p].ops[o].data;
            if !data.is_empty() {
                placements[p][o] = Some(blob.len() as u64);
                blob.extend_from_slice(data);
            }
        }

        for (p, partition) in self.partitions.iter().enumerate() {
            let operations = partition
                .ops
                .iter()
                .enumerate()
                .map(|(o, op)| {
                    let data_offset = placements[p][o];
                    InstallOperation {
                        r#type: op.kind,
                        data_offset,
                        data_length: data_offset.map(|_| op.data.len() as u64),
                        data_sha256_hash: data_offset
                            .filter(|_| self.hash_operations)
                            .map(|_| sha256(&op.data)),
                        dst_extents: op
                            .dst
                            .iter()
                            .map(|&(start_block, num_blocks)| Extent {
                                start_block: Some(start_block),
                                num_blocks: Some(num_blocks),
                            })
                            .collect(),
                        ..Default::default()
                    }
                })
                .collect();

            partitions.push(PartitionUpdate {
                partition_name: partition.name.clone(),
                new_partition_info: partition.info.clone(),
                operations,
                ..Default::default()
            });
        }

        let manifest = DeltaArchiveManifest {
            block_size: Some(self.block_size),
            minor_version: Some(self.minor_version),
            partitions,
            ..Default::default()
        };

        (manifest, blob)
    }

    pub fn build(&self) -> Vec<u8> {
        let (manifest, blob) = self.manifest();
        let manifest = manifest.encode_to_vec();

        let mut out = Vec::new();
        out.extend_from_slice(b"CrAU");
        out.extend_from_slice(&self.version.to_be_bytes());
        out.extend_from_slice(&(manifest.len() as u64).to_be_bytes());
        if self.version > 1 {
            out.extend_from_slice(&(self.metadata_signature.len() as u32).to_be_bytes());
        }
        out.extend_from_slice(&manifest);
        if self.version > 1 {
            out.extend_from_slice(&self.metadata_signature);
        }
        out.extend_from_slice(&blob);

        out
    }
}

/// Store `payload` as `payload.bin` in a zip archive next to some metadata.
pub fn zip_payload(payload: &[u8], method: zip::CompressionMethod) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default().compression_method(method);

    writer
        .start_file("META-INF/com/android/metadata", options)
        .unwrap();
    writer.write_all(b"ota-type=AB\n").unwrap();
    writer.start_file("payload.bin", options).unwrap();
    writer.write_all(payload).unwrap();
    writer
        .start_file("payload_properties.txt", options)
        .unwrap();
    writer.write_all(b"FILE_HASH=\n").unwrap();

    writer.finish().unwrap().into_inner()
}
