use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::chromeos_update_engine::{InstallOperation, PartitionUpdate};
use crate::error::{Error, Result};
use crate::operation::{self, OperationKind};
use crate::payload::PayloadHeader;
use crate::writer::OrderedFileWriter;

const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// How the output image size is derived from a partition's operations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SizePolicy {
    /// End of the last extent of the last operation. Payload generators emit
    /// operations in ascending destination order, so this is the image end.
    #[default]
    LastExtent,
    /// Maximum extent end over every operation, for manifests whose
    /// operations are not in destination order.
    MaxExtent,
}

#[derive(Clone, Debug)]
pub struct ExtractOptions {
    /// Worker threads for decompression. 0 uses every available core.
    pub threads: usize,
    /// Check operation and image SHA-256 digests recorded in the manifest.
    pub verify: bool,
    pub size_policy: SizePolicy,
    /// Capacity of the read and write queues. Defaults to twice the number
    /// of workers.
    pub queue_depth: Option<usize>,
    /// Accept payload format versions other than 2 with a warning.
    pub allow_unknown_version: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            verify: true,
            size_policy: SizePolicy::default(),
            queue_depth: None,
            allow_unknown_version: false,
        }
    }
}

/// Receives progress notifications. Methods are called from worker threads.
pub trait ExtractObserver: Sync {
    fn on_partition_start(&self, _name: &str, _operations: usize, _size: u64) {}

    fn on_operation_done(&self, _name: &str) {}

    fn on_partition_finish(&self, _name: &str, _result: &Result<PartitionSummary>) {}
}

/// Observer that ignores every notification.
pub struct NoopObserver;

impl ExtractObserver for NoopObserver {}

#[derive(Clone, Debug)]
pub struct PartitionSummary {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub operations: usize,
    pub elapsed: Duration,
    /// Whether the image was checked against the manifest's partition hash.
    pub verified: bool,
}

/// Result of one requested partition. A failed partition never affects the
/// others in the same run.
#[derive(Debug)]
pub struct PartitionOutcome {
    pub name: String,
    pub result: Result<PartitionSummary>,
}

/// Output path of a partition's image inside `out_dir`.
pub fn image_path(out_dir: &Path, name: &str) -> PathBuf {
    out_dir.join(format!("{name}.img"))
}

/// Size in bytes of the image reconstructed from `partition`.
pub fn partition_size(
    partition: &PartitionUpdate,
    block_size: u64,
    policy: SizePolicy,
) -> Result<u64> {
    match policy {
        SizePolicy::LastExtent => {
            match partition.operations.last().and_then(|op| op.dst_extents.last()) {
                Some(extent) => operation::extent_end(extent, block_size),
                None => Ok(declared_size(partition)),
            }
        }
        SizePolicy::MaxExtent => {
            let mut size = None;

            for extent in partition.operations.iter().flat_map(|op| &op.dst_extents) {
                let end = operation::extent_end(extent, block_size)?;
                size = Some(size.map_or(end, |s: u64| s.max(end)));
            }

            Ok(size.unwrap_or_else(|| declared_size(partition)))
        }
    }
}

fn declared_size(partition: &PartitionUpdate) -> u64 {
    partition
        .new_partition_info
        .as_ref()
        .and_then(|info| info.size)
        .unwrap_or(0)
}

/// Create (or truncate) the image file and size it before any write, so that
/// out-of-order writes always target valid offsets.
pub fn create_output_image(path: &Path, size: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(size)?;

    Ok(file)
}

fn build_pool(threads: usize) -> Result<ThreadPool> {
    let mut builder = ThreadPoolBuilder::new().thread_name(|i| format!("payload-worker-{i}"));
    if threads > 0 {
        builder = builder.num_threads(threads);
    }

    builder.build().map_err(|e| Error::Io(io::Error::other(e)))
}

/// Read an operation's blob bytes. `data_offset` is relative to the blob
/// region that starts at `blob_offset`.
fn read_blob<R: Read + Seek>(
    reader: &mut R,
    blob_offset: u64,
    op: &InstallOperation,
) -> Result<Vec<u8>> {
    let offset = op.data_offset.ok_or(Error::MissingField("data_offset"))?;
    let length = op.data_length.ok_or(Error::MissingField("data_length"))?;
    let start = blob_offset
        .checked_add(offset)
        .ok_or_else(|| Error::MalformedManifest(format!("data offset {offset} overflows")))?;

    reader.seek(SeekFrom::Start(start))?;

    let mut data = Vec::with_capacity(length.min(64 * 1024 * 1024) as usize);
    reader.take(length).read_to_end(&mut data)?;
    if data.len() as u64 != length {
        return Err(Error::MalformedContainer(format!(
            "operation data truncated: expected {length} bytes at offset {start}, got {}",
            data.len(),
        )));
    }

    Ok(data)
}

fn sha256_file(file: &mut File) -> io::Result<[u8; 32]> {
    file.seek(SeekFrom::Start(0))?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    Ok(digest)
}

/// One operation handed from the reader to a worker.
struct Job {
    index: usize,
    data: Vec<u8>,
}

/// Everything a partition run borrows from the extractor besides the reader.
struct Context<'a> {
    pool: &'a ThreadPool,
    options: &'a ExtractOptions,
    cancel: &'a AtomicBool,
    blob_offset: u64,
    block_size: u64,
}

impl Context<'_> {
    fn queue_depth(&self) -> usize {
        self.options
            .queue_depth
            .unwrap_or(self.pool.current_num_threads() * 2)
            .max(1)
    }
}

/// First failure of a partition run. Later failures are dropped.
struct FailureSlot {
    failed: AtomicBool,
    error: Mutex<Option<Error>>,
}

impl FailureSlot {
    fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn set(&self, error: Error) {
        let mut slot = self.error.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(error);
        }
        self.failed.store(true, Ordering::Release);
    }

    fn into_inner(self) -> Option<Error> {
        self.error.into_inner().unwrap_or_else(|e| e.into_inner())
    }
}

fn operation_error(index: usize, op: &InstallOperation, error: Error) -> Error {
    Error::Operation {
        index,
        kind: OperationKind::of(op).to_string(),
        source: Box::new(error),
    }
}

fn apply_operation(
    op: &InstallOperation,
    data: Vec<u8>,
    ctx: &Context<'_>,
    writer: &OrderedFileWriter,
) -> Result<()> {
    let chunks = operation::decode_operation(op, data, ctx.block_size, ctx.options.verify)?;
    for chunk in chunks {
        writer.submit(chunk)?;
    }

    Ok(())
}

/// Reconstruct one partition into `path`.
///
/// Blobs are read on the calling thread in ascending `data_offset` order and
/// handed to the pool's workers through a bounded queue; each worker decodes
/// and submits chunks to the image writer. The first failure stops further
/// reads, the remaining queued jobs are discarded, and the error is returned
/// once every worker and the writer have finished.
fn extract_one<R: Read + Seek>(
    reader: &mut R,
    ctx: &Context<'_>,
    partition: &PartitionUpdate,
    path: &Path,
    observer: &dyn ExtractObserver,
) -> Result<PartitionSummary> {
    let start = Instant::now();
    let name = partition.partition_name.as_str();
    let operations = &partition.operations;

    let size = partition_size(partition, ctx.block_size, ctx.options.size_policy)?;
    let file = create_output_image(path, size)?;
    observer.on_partition_start(name, operations.len(), size);

    let depth = ctx.queue_depth();
    let writer = OrderedFileWriter::preallocated(file, depth)?;
    let failure = FailureSlot::new();

    // Stable, so operations without data keep their manifest order.
    let mut order = (0..operations.len()).collect::<Vec<_>>();
    order.sort_by_key(|&i| operations[i].data_offset.unwrap_or(0));

    let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(depth);

    ctx.pool.in_place_scope(|scope| {
        for _ in 0..ctx.pool.current_num_threads() {
            let job_rx = job_rx.clone();
            let writer = &writer;
            let failure = &failure;

            scope.spawn(move |_| {
                for job in job_rx {
                    if failure.is_set() {
                        continue;
                    }

                    let op = &operations[job.index];
                    match apply_operation(op, job.data, ctx, writer) {
                        Ok(()) => observer.on_operation_done(name),
                        Err(e) => {
                            debug!("Operation #{} of {name} failed: {e}", job.index);
                            failure.set(operation_error(job.index, op, e));
                        }
                    }
                }
            });
        }
        drop(job_rx);

        for &index in &order {
            if failure.is_set() {
                break;
            }
            if ctx.cancel.load(Ordering::Acquire) {
                failure.set(Error::Cancelled);
                break;
            }

            let op = &operations[index];
            let data = if OperationKind::of(op).reads_data() {
                match read_blob(reader, ctx.blob_offset, op) {
                    Ok(data) => data,
                    Err(e) => {
                        failure.set(operation_error(index, op, e));
                        break;
                    }
                }
            } else {
                Vec::new()
            };

            if job_tx.send(Job { index, data }).is_err() {
                break;
            }
        }
        drop(job_tx);
    });

    let finished = writer.finish();
    if let Some(e) = failure.into_inner() {
        return Err(e);
    }
    let mut file = finished?;

    let actual_size = file.metadata()?.len();
    if let Some(declared) = partition.new_partition_info.as_ref().and_then(|i| i.size) {
        if declared != actual_size {
            warn!("Image size of {name} is {actual_size}, but manifest declares {declared}");
        }
    }

    let mut verified = false;
    if ctx.options.verify {
        if let Some(expected) = partition
            .new_partition_info
            .as_ref()
            .and_then(|i| i.hash.as_ref())
        {
            let actual = sha256_file(&mut file)?;
            if actual.as_slice() != expected.as_slice() {
                return Err(Error::HashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }
            verified = true;
        }
    }

    Ok(PartitionSummary {
        name: name.to_owned(),
        path: path.to_owned(),
        size: actual_size,
        operations: operations.len(),
        elapsed: start.elapsed(),
        verified,
    })
}

/// Drives partition reconstruction from one payload stream.
///
/// The header and manifest are parsed once in [`new`](Self::new); every
/// extraction afterwards reuses them and the worker pool.
pub struct PayloadExtractor<R> {
    reader: R,
    header: PayloadHeader,
    pool: ThreadPool,
    options: ExtractOptions,
    cancel: Arc<AtomicBool>,
}

impl<R: Read + Seek> PayloadExtractor<R> {
    /// Parse the payload header from the start of `reader`. Nothing is
    /// written to disk if this fails.
    pub fn new(mut reader: R, options: ExtractOptions) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let header = PayloadHeader::from_reader(&mut reader, options.allow_unknown_version)?;
        let pool = build_pool(options.threads)?;

        Ok(Self {
            reader,
            header,
            pool,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share a flag that stops extraction when set (eg. from a Ctrl+C
    /// handler). In-flight partitions fail with [`Error::Cancelled`].
    pub fn with_cancel_signal(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn header(&self) -> &PayloadHeader {
        &self.header
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Extract the partition called `name` into `path`.
    pub fn extract_partition(
        &mut self,
        name: &str,
        path: &Path,
        observer: &dyn ExtractObserver,
    ) -> Result<PartitionSummary> {
        let Self {
            reader,
            header,
            pool,
            options,
            cancel,
        } = self;

        let partition = header
            .partition(name)
            .ok_or_else(|| Error::PartitionNotFound(name.to_owned()))?;
        let ctx = Context {
            pool,
            options,
            cancel,
            blob_offset: header.blob_offset,
            block_size: header.block_size(),
        };

        extract_one(reader, &ctx, partition, path, observer)
    }

    /// Extract the partitions in `names` (every partition if empty) into
    /// `<out_dir>/<name>.img`.
    ///
    /// Names missing from the manifest are reported as
    /// [`Error::PartitionNotFound`] outcomes; a failed partition does not
    /// stop the remaining ones. Only failing to create `out_dir` is an error
    /// for the whole run.
    pub fn extract_all(
        &mut self,
        names: &[String],
        out_dir: &Path,
        observer: &dyn ExtractObserver,
    ) -> Result<Vec<PartitionOutcome>> {
        fs::create_dir_all(out_dir)?;

        let Self {
            reader,
            header,
            pool,
            options,
            cancel,
        } = self;

        let ctx = Context {
            pool,
            options,
            cancel,
            blob_offset: header.blob_offset,
            block_size: header.block_size(),
        };

        let mut outcomes = Vec::new();
        let mut selected: Vec<&PartitionUpdate> = Vec::new();

        if names.is_empty() {
            selected.extend(header.partitions().iter());
        } else {
            for name in names {
                if selected.iter().any(|p| &p.partition_name == name) {
                    continue;
                }

                match header.partition(name) {
                    Some(p) => selected.push(p),
                    None => {
                        warn!("Partition {name} not found in payload");
                        outcomes.push(PartitionOutcome {
                            name: name.clone(),
                            result: Err(Error::PartitionNotFound(name.clone())),
                        });
                    }
                }
            }
        }

        for partition in selected {
            let name = &partition.partition_name;

            let result = if ctx.cancel.load(Ordering::Acquire) {
                Err(Error::Cancelled)
            } else {
                info!("Extracting {name}");
                extract_one(reader, &ctx, partition, &image_path(out_dir, name), observer)
            };

            match &result {
                Ok(summary) => info!(
                    "Extracted {name} ({} bytes, {} operations) in {:.2?}",
                    summary.size, summary.operations, summary.elapsed,
                ),
                Err(e) => warn!("Failed to extract {name}: {e}"),
            }

            observer.on_partition_finish(name, &result);
            outcomes.push(PartitionOutcome {
                name: name.clone(),
                result,
            });
        }

        Ok(outcomes)
    }
}
