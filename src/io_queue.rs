use std::future::Future;
use std::io::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::JoinHandle as ThreadHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// One I/O scheduling context connections are pinned to.
#[derive(Debug)]
pub enum IoQueue {
    /// Tasks run on the ambient runtime, resumed wherever the runtime polls them.
    Inline,
    /// Tasks run on a dedicated single-threaded runtime.
    Dedicated {
        handle: Handle,
        stop: Option<oneshot::Sender<()>>,
        thread: Option<ThreadHandle<()>>,
    },
}

impl IoQueue {
    pub fn dedicated(index: usize) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let handle = runtime.handle().clone();
        let (stop, stopped) = oneshot::channel::<()>();
        let thread = std::thread::Builder::new()
            .name(format!("quic-io-{}", index))
            .spawn(move || {
                runtime.block_on(async {
                    let _ = stopped.await;
                });
            })?;
        Ok(Self::Dedicated {
            handle,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        match self {
            Self::Inline => tokio::spawn(future),
            Self::Dedicated { handle, .. } => handle.spawn(future),
        }
    }
}

impl Drop for IoQueue {
    fn drop(&mut self) {
        if let Self::Dedicated { stop, thread, .. } = self {
            if let Some(stop) = stop.take() {
                let _ = stop.send(());
            }
            // The last pool reference can be dropped from a task on this very
            // queue, so the thread is detached rather than joined.
            drop(thread.take());
        }
    }
}

/// Fixed set of I/O queues handed out round-robin.
#[derive(Debug)]
pub struct IoQueuePool {
    queues: Vec<IoQueue>,
    next: AtomicUsize,
}

impl IoQueuePool {
    /// `inline` selects ambient-runtime dispatch for every queue instead of
    /// dedicated threads. A count of 0 means a single inline queue.
    pub fn new(count: usize, inline: bool) -> Result<Self> {
        let inline = inline || count == 0;
        let queues = (0..count.max(1))
            .map(|index| match inline {
                true => Ok(IoQueue::Inline),
                false => IoQueue::dedicated(index),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            queues,
            next: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Index of the queue the next connection is assigned to.
    pub fn next_index(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len()
    }

    pub fn get(&self, index: usize) -> &IoQueue {
        &self.queues[index % self.queues.len()]
    }
}
