use crate::buffer_pool::BufferPool;
use crate::error::ConnectionError;
use crate::sync;
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeOptions {
    /// Buffered byte count at which a flushing writer is suspended. 0 disables backpressure.
    pub pause_writer_threshold: usize,
    /// Buffered byte count at or below which a suspended writer is resumed.
    pub resume_writer_threshold: usize,
    /// Smallest region handed out by `PipeWriter::get_memory`.
    pub minimum_segment_size: usize,
}

impl Default for PipeOptions {
    fn default() -> Self {
        Self {
            pause_writer_threshold: 1024 * 1024,
            resume_writer_threshold: 512 * 1024,
            minimum_segment_size: crate::buffer_pool::DEFAULT_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeMetrics {
    pub buffered: usize,
    pub writer_pauses: u64,
    pub writer_resumes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushResult {
    /// The reader is gone, nothing written from now on will be consumed.
    pub is_completed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadResult {
    /// Number of readable bytes; see `PipeReader::regions`.
    pub len: usize,
    pub is_canceled: bool,
    /// The writer is done, no more data will arrive after what is buffered.
    pub is_completed: bool,
}

impl ReadResult {
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
struct PipeState {
    segments: VecDeque<Bytes>,
    buffered: usize,
    writer_paused: bool,
    writer_completed: bool,
    writer_error: Option<ConnectionError>,
    reader_completed: bool,
    reader_error: Option<ConnectionError>,
    read_canceled: bool,
    writer_pauses: u64,
    writer_resumes: u64,
}

/// Bounded single-producer/single-consumer byte pipe.
#[derive(Debug)]
pub struct Pipe {
    options: PipeOptions,
    state: Mutex<PipeState>,
    readable: Notify,
    writable: Notify,
}

/// Creates a pipe and returns its two ends.
pub fn pipe(options: PipeOptions, pool: Arc<BufferPool>) -> (PipeWriter, PipeReader) {
    let pipe = Arc::new(Pipe {
        options,
        state: Mutex::new(PipeState::default()),
        readable: Notify::new(),
        writable: Notify::new(),
    });
    let writer = PipeWriter {
        pipe: pipe.clone(),
        pool,
        staging: BytesMut::new(),
    };
    (writer, PipeReader { pipe })
}

impl Pipe {
    fn lock(&self) -> MutexGuard<'_, PipeState> {
        sync::lock(&self.state)
    }

    /// Makes the pending (or next) `PipeReader::read` return with `is_canceled` set.
    pub fn cancel_pending_read(&self) {
        self.lock().read_canceled = true;
        self.readable.notify_one();
    }

    pub fn metrics(&self) -> PipeMetrics {
        let state = self.lock();
        PipeMetrics {
            buffered: state.buffered,
            writer_pauses: state.writer_pauses,
            writer_resumes: state.writer_resumes,
        }
    }

    pub fn is_writer_completed(&self) -> bool {
        self.lock().writer_completed
    }

    pub fn is_reader_completed(&self) -> bool {
        self.lock().reader_completed
    }

    fn complete_writer(&self, error: Option<ConnectionError>) {
        {
            let mut state = self.lock();
            if state.writer_completed {
                return;
            }
            state.writer_completed = true;
            state.writer_error = error;
        }
        self.readable.notify_one();
    }

    fn complete_reader(&self, error: Option<ConnectionError>) {
        {
            let mut state = self.lock();
            if state.reader_completed {
                return;
            }
            state.reader_completed = true;
            state.reader_error = error;
            state.segments.clear();
            state.buffered = 0;
        }
        self.writable.notify_one();
    }
}

#[derive(Debug)]
pub struct PipeWriter {
    pipe: Arc<Pipe>,
    pool: Arc<BufferPool>,
    staging: BytesMut,
}

impl PipeWriter {
    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    /// Returns a writable region of at least `min_size` bytes. Written bytes
    /// become visible to the reader once committed with `advance`.
    pub fn get_memory(&mut self, min_size: usize) -> &mut [u8] {
        let min_size = min_size.max(1);
        if self.staging.len() < min_size {
            self.staging = self
                .pool
                .rent(min_size.max(self.pipe.options.minimum_segment_size));
        }
        &mut self.staging[..]
    }

    /// Commits the first `count` bytes of the region returned by `get_memory`.
    /// A count past the end of the region commits the whole region.
    pub fn advance(&mut self, count: usize) {
        let count = count.min(self.staging.len());
        if count == 0 {
            return;
        }
        let segment = self.staging.split_to(count).freeze();
        {
            let mut state = self.pipe.lock();
            if state.reader_completed {
                return;
            }
            state.segments.push_back(segment);
            state.buffered += count;
        }
        self.pipe.readable.notify_one();
    }

    /// Waits until the reader has caught up if the pipe is above its pause threshold.
    pub async fn flush(&mut self) -> Result<FlushResult, ConnectionError> {
        let options = self.pipe.options;
        loop {
            {
                let mut state = self.pipe.lock();
                if state.reader_completed {
                    return match state.reader_error.take() {
                        Some(error) => Err(error),
                        None => Ok(FlushResult { is_completed: true }),
                    };
                }
                if !state.writer_paused {
                    if options.pause_writer_threshold == 0
                        || state.buffered < options.pause_writer_threshold
                    {
                        return Ok(FlushResult {
                            is_completed: false,
                        });
                    }
                    state.writer_paused = true;
                    state.writer_pauses += 1;
                    trace!(buffered = state.buffered, "pipe writer paused");
                }
                if state.buffered <= options.resume_writer_threshold {
                    state.writer_paused = false;
                    state.writer_resumes += 1;
                    trace!(buffered = state.buffered, "pipe writer resumed");
                    return Ok(FlushResult {
                        is_completed: false,
                    });
                }
            }
            self.pipe.writable.notified().await;
        }
    }

    /// Copies `data` into the pipe and flushes it.
    pub async fn write(&mut self, mut data: &[u8]) -> Result<FlushResult, ConnectionError> {
        while !data.is_empty() {
            let region = self.get_memory(1);
            let count = region.len().min(data.len());
            region[..count].copy_from_slice(&data[..count]);
            self.advance(count);
            data = &data[count..];
        }
        self.flush().await
    }

    /// Signals that nothing more will be written. Only the first completion counts.
    pub fn complete(&mut self, error: Option<ConnectionError>) {
        self.pipe.complete_writer(error);
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.pipe.complete_writer(None);
    }
}

#[derive(Debug)]
pub struct PipeReader {
    pipe: Arc<Pipe>,
}

impl PipeReader {
    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    /// Waits for buffered data, writer completion or cancellation.
    ///
    /// A writer that completed with an error surfaces it once, ahead of any
    /// buffered data.
    pub async fn read(&mut self) -> Result<ReadResult, ConnectionError> {
        loop {
            {
                let mut state = self.pipe.lock();
                if let Some(error) = state.writer_error.take() {
                    return Err(error);
                }
                if state.read_canceled {
                    state.read_canceled = false;
                    return Ok(ReadResult {
                        len: state.buffered,
                        is_canceled: true,
                        is_completed: state.writer_completed,
                    });
                }
                if state.buffered > 0 || state.writer_completed {
                    return Ok(ReadResult {
                        len: state.buffered,
                        is_canceled: false,
                        is_completed: state.writer_completed,
                    });
                }
            }
            self.pipe.readable.notified().await;
        }
    }

    /// Replaces the content of `regions` with the currently buffered segments.
    pub fn regions(&self, regions: &mut Vec<Bytes>) {
        let state = self.pipe.lock();
        regions.clear();
        regions.extend(state.segments.iter().cloned());
    }

    /// Releases the first `count` buffered bytes.
    pub fn advance(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        {
            let mut state = self.pipe.lock();
            let count = count.min(state.buffered);
            state.buffered -= count;
            let mut remaining = count;
            while remaining > 0 {
                let Some(front) = state.segments.front_mut() else {
                    break;
                };
                if front.len() <= remaining {
                    remaining -= front.len();
                    state.segments.pop_front();
                } else {
                    front.advance(remaining);
                    remaining = 0;
                }
            }
        }
        self.pipe.writable.notify_one();
    }

    /// Reads the next buffered segment, `None` once the writer completed and
    /// everything has been consumed.
    pub async fn read_chunk(&mut self) -> Result<Option<Bytes>, ConnectionError> {
        loop {
            let result = self.read().await?;
            if !result.is_empty() {
                let chunk = self.pipe.lock().segments.front().cloned();
                if let Some(chunk) = chunk {
                    self.advance(chunk.len());
                    return Ok(Some(chunk));
                }
            }
            if result.is_completed {
                return Ok(None);
            }
        }
    }

    /// Signals that nothing more will be read. The writer observes `error`
    /// on its next flush.
    pub fn complete(&mut self, error: Option<ConnectionError>) {
        self.pipe.complete_reader(error);
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        self.pipe.complete_reader(None);
    }
}
