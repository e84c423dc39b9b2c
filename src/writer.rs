use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::operation::{Chunk, ChunkData};
use crate::stream;

/// First write failure, kept as kind + message so it can be handed to every
/// submitter that comes after it.
type Failure = Arc<Mutex<Option<(io::ErrorKind, String)>>>;

/// Funnels positioned writes from many producers into one output file.
///
/// Producers call [`submit`](Self::submit) from any thread. A single drain
/// thread owns the file and performs `seek` + `write` for each chunk in
/// arrival order; correctness comes from every chunk carrying its absolute
/// offset, not from that order. The queue is bounded, so producers block
/// when the disk falls behind.
pub struct OrderedFileWriter {
    sender: Option<Sender<Chunk>>,
    worker: Option<JoinHandle<io::Result<File>>>,
    failure: Failure,
}

impl OrderedFileWriter {
    /// Writer that materializes every zero run.
    pub fn new(file: File, capacity: usize) -> io::Result<Self> {
        Self::spawn(file, capacity, false)
    }

    /// Writer for a file that was freshly created and sized with
    /// [`File::set_len`], where unwritten ranges already read back as zeros.
    /// Zero runs inside the file are skipped; runs past its end extend it.
    pub fn preallocated(file: File, capacity: usize) -> io::Result<Self> {
        Self::spawn(file, capacity, true)
    }

    fn spawn(file: File, capacity: usize, sparse_zeros: bool) -> io::Result<Self> {
        let (sender, receiver) = bounded(capacity.max(1));
        let failure = Failure::default();

        let worker = thread::Builder::new()
            .name("image-writer".into())
            .spawn({
                let failure = failure.clone();
                move || drain(file, receiver, sparse_zeros, &failure)
            })?;

        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
            failure,
        })
    }

    fn failure(&self) -> Option<io::Error> {
        let failure = self.failure.lock().unwrap_or_else(|e| e.into_inner());
        failure
            .as_ref()
            .map(|(kind, message)| io::Error::new(*kind, message.clone()))
    }

    /// Queue a chunk, blocking while the queue is full. Fails once any
    /// earlier write has failed.
    pub fn submit(&self, chunk: Chunk) -> io::Result<()> {
        if let Some(e) = self.failure() {
            return Err(e);
        }

        let Some(sender) = &self.sender else {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "output writer is closed",
            ));
        };

        sender.send(chunk).map_err(|_| {
            self.failure().unwrap_or_else(|| {
                io::Error::new(io::ErrorKind::BrokenPipe, "output writer has stopped")
            })
        })
    }

    /// Wait until every submitted chunk has been written and return the file.
    pub fn finish(mut self) -> io::Result<File> {
        self.close()
    }

    fn close(&mut self) -> io::Result<File> {
        drop(self.sender.take());

        let Some(worker) = self.worker.take() else {
            return Err(io::Error::other("output writer already closed"));
        };

        worker
            .join()
            .map_err(|_| io::Error::other("output writer thread panicked"))?
    }
}

impl Drop for OrderedFileWriter {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.close();
        }
    }
}

fn drain(
    mut file: File,
    receiver: Receiver<Chunk>,
    sparse_zeros: bool,
    failure: &Failure,
) -> io::Result<File> {
    let mut file_len = file.metadata()?.len();

    // Returning drops the receiver, which wakes any blocked submitter.
    for chunk in receiver {
        if let Err(e) = write_chunk(&mut file, &mut file_len, &chunk, sparse_zeros) {
            let mut slot = failure.lock().unwrap_or_else(|e| e.into_inner());
            *slot = Some((
                e.kind(),
                format!(
                    "failed to write {} bytes at offset {}: {e}",
                    chunk.len(),
                    chunk.offset,
                ),
            ));
            return Err(e);
        }
    }

    file.flush()?;
    Ok(file)
}

fn write_chunk(
    file: &mut File,
    file_len: &mut u64,
    chunk: &Chunk,
    sparse_zeros: bool,
) -> io::Result<()> {
    let end = chunk
        .offset
        .checked_add(chunk.len())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "chunk end overflows"))?;

    match &chunk.data {
        ChunkData::Zeros(_) if sparse_zeros => {
            if end > *file_len {
                file.set_len(end)?;
            }
        }
        ChunkData::Zeros(len) => {
            file.seek(SeekFrom::Start(chunk.offset))?;
            stream::write_zeros(&mut *file, *len)?;
        }
        ChunkData::Bytes(data) => {
            file.seek(SeekFrom::Start(chunk.offset))?;
            file.write_all(data)?;
        }
    }

    *file_len = (*file_len).max(end);

    Ok(())
}
