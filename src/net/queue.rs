//! Outbound Queue
//!
//! Every connection writes through one of these: commands are pushed from
//! anywhere, a single worker task drains them in order onto the socket
//! sink. The worker owns the sink, so no lock is ever held across a
//! socket await. An optional idle hook produces keep-alive traffic when
//! the queue has had nothing to write for a configured interval.
//! Whatever makes the worker exit leaves the queue closed, which
//! [`SendQueue::closed`] lets the owning connection wait on.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt};
use thiserror::Error;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::wire::Command;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Consecutive write failures after which the worker gives up.
const MAX_WRITE_FAILURES: u32 = 5;

/// Pause between retries of a failed write.
const WRITE_RETRY_BACKOFF: Duration = Duration::from_millis(250);

// =============================================================================
// TYPES
// =============================================================================

/// Errors surfaced by [`SendQueue`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue has no live worker, so a push would never be written.
    #[error("send queue is not running")]
    NotRunning,
}

/// Callback invoked when the queue has been idle for the configured
/// interval. A returned command is written as ordinary traffic; `None`
/// just restarts the idle window.
pub type IdleHook = Box<dyn FnMut() -> Option<Command> + Send>;

struct Inner {
    pending: Mutex<VecDeque<Command>>,
    notify: Notify,
    running: AtomicBool,
    stopping: AtomicBool,
    alive_tx: watch::Sender<bool>,
    idle_tx: watch::Sender<Option<Duration>>,
    idle_hook: Mutex<Option<IdleHook>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// FIFO command queue with a single writer task.
///
/// Cloning yields another handle to the same queue.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Inner>,
}

impl SendQueue {
    /// New queue with no worker. Pushes fail until [`start`](Self::start).
    pub fn new() -> Self {
        let (idle_tx, _) = watch::channel(None);
        let (alive_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                alive_tx,
                idle_tx,
                idle_hook: Mutex::new(None),
                worker: Mutex::new(None),
            }),
        }
    }

    /// Spawn the worker writing to `sink`.
    ///
    /// A previous worker, if any, is aborted first; a reconnected session
    /// reuses its queue with the fresh socket this way.
    pub async fn start<T>(&self, sink: T)
    where
        T: Sink<Command> + Unpin + Send + 'static,
        T::Error: std::fmt::Display + Send,
    {
        if let Some(old) = self.inner.worker.lock().await.take() {
            old.abort();
        }
        self.inner.stopping.store(false, Ordering::SeqCst);
        self.inner.running.store(true, Ordering::SeqCst);
        self.inner.alive_tx.send_replace(true);

        let inner = Arc::clone(&self.inner);
        let idle_rx = self.inner.idle_tx.subscribe();
        let handle = tokio::spawn(run_worker(inner, sink, idle_rx));
        *self.inner.worker.lock().await = Some(handle);
    }

    /// Whether a worker is accepting pushes.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Waits until the queue has no live worker.
    ///
    /// Resolves immediately when none is running; otherwise resolves
    /// once the worker exits, whether it drained, died, or was aborted.
    pub async fn closed(&self) {
        let mut alive_rx = self.inner.alive_tx.subscribe();
        while *alive_rx.borrow() {
            if alive_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Append a command for delivery.
    pub async fn push(&self, command: Command) -> Result<(), QueueError> {
        if !self.is_running() {
            return Err(QueueError::NotRunning);
        }
        self.inner.pending.lock().await.push_back(command);
        self.inner.notify.notify_one();
        Ok(())
    }

    /// Number of commands waiting to be written.
    pub async fn len(&self) -> usize {
        self.inner.pending.lock().await.len()
    }

    /// Whether nothing is waiting to be written.
    pub async fn is_empty(&self) -> bool {
        self.inner.pending.lock().await.is_empty()
    }

    /// Discard everything queued but not yet handed to the sink.
    ///
    /// A command already in flight on the worker still lands.
    pub async fn clear(&self) {
        self.inner.pending.lock().await.clear();
    }

    /// Configure the idle hook: after `interval` without a write, `hook`
    /// runs and may produce a command. Reconfiguring restarts the idle
    /// window from now.
    pub async fn set_idle(&self, interval: Duration, hook: IdleHook) {
        *self.inner.idle_hook.lock().await = Some(hook);
        self.inner.idle_tx.send_replace(Some(interval));
    }

    /// Remove the idle hook.
    pub async fn clear_idle(&self) {
        *self.inner.idle_hook.lock().await = None;
        self.inner.idle_tx.send_replace(None);
    }

    /// Stop accepting pushes and let the worker drain what is queued,
    /// waiting at most `grace`. Returns `true` if the worker finished
    /// inside the grace period; on timeout the worker is aborted.
    pub async fn stop(&self, grace: Duration) -> bool {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.notify.notify_one();

        let handle = self.inner.worker.lock().await.take();
        let Some(handle) = handle else {
            return true;
        };
        let abort = handle.abort_handle();
        let drained = match tokio::time::timeout(grace, handle).await {
            Ok(_) => true,
            Err(_) => {
                abort.abort();
                false
            }
        };
        // An aborted worker never reaches its own exit path, so the
        // closed signal is flipped here as well.
        self.inner.alive_tx.send_replace(false);
        drained
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// WORKER
// =============================================================================

async fn run_worker<T>(
    inner: Arc<Inner>,
    mut sink: T,
    mut idle_rx: watch::Receiver<Option<Duration>>,
) where
    T: Sink<Command> + Unpin,
    T::Error: std::fmt::Display,
{
    let mut failures: u32 = 0;
    let mut idle_from = Instant::now();

    loop {
        // The head comes out of the deque before the write; a failed
        // write puts it back at the front, so a retried command keeps
        // its place in line.
        let next = inner.pending.lock().await.pop_front();

        if let Some(command) = next {
            match sink.send(command.clone()).await {
                Ok(()) => {
                    failures = 0;
                    idle_from = Instant::now();
                }
                Err(err) => {
                    failures += 1;
                    if failures >= MAX_WRITE_FAILURES {
                        warn!(
                            failures,
                            error = %err,
                            "send queue giving up after repeated write failures"
                        );
                        break;
                    }
                    debug!(failures, error = %err, "command write failed, retrying");
                    inner.pending.lock().await.push_front(command);
                    tokio::time::sleep(WRITE_RETRY_BACKOFF).await;
                }
            }
            continue;
        }

        if inner.stopping.load(Ordering::SeqCst) {
            break;
        }

        let interval = *idle_rx.borrow();
        tokio::select! {
            _ = inner.notify.notified() => {}
            _ = idle_rx.changed() => {
                idle_from = Instant::now();
            }
            _ = idle_elapsed(interval, idle_from) => {
                let produced = {
                    let mut hook = inner.idle_hook.lock().await;
                    hook.as_mut().and_then(|hook| hook())
                };
                match produced {
                    Some(command) => {
                        inner.pending.lock().await.push_back(command);
                    }
                    None => idle_from = Instant::now(),
                }
            }
        }
    }

    inner.running.store(false, Ordering::SeqCst);
    inner.alive_tx.send_replace(false);
    debug!("send queue worker stopped");
}

async fn idle_elapsed(interval: Option<Duration>, from: Instant) {
    match interval {
        Some(interval) => tokio::time::sleep_until(from + interval).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Value;
    use std::io;
    use std::pin::Pin;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;
    use std::task::{Context, Poll, Waker};

    #[derive(Default)]
    struct Gate {
        open: bool,
        waker: Option<Waker>,
    }

    /// Sink that records what lands in it, with knobs for failure
    /// injection and for holding the worker at the ready check.
    #[derive(Clone)]
    struct RecordingSink {
        sent: Arc<StdMutex<Vec<Command>>>,
        fail_remaining: Arc<AtomicU32>,
        gate: Option<Arc<StdMutex<Gate>>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                sent: Arc::new(StdMutex::new(Vec::new())),
                fail_remaining: Arc::new(AtomicU32::new(0)),
                gate: None,
            }
        }

        fn failing(times: u32) -> Self {
            let sink = Self::new();
            sink.fail_remaining.store(times, Ordering::SeqCst);
            sink
        }

        fn gated() -> Self {
            let mut sink = Self::new();
            sink.gate = Some(Arc::new(StdMutex::new(Gate::default())));
            sink
        }

        fn open_gate(&self) {
            if let Some(gate) = &self.gate {
                let mut gate = gate.lock().unwrap();
                gate.open = true;
                if let Some(waker) = gate.waker.take() {
                    waker.wake();
                }
            }
        }

        fn sent(&self) -> Vec<Command> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Sink<Command> for RecordingSink {
        type Error = io::Error;

        fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            if let Some(gate) = &self.gate {
                let mut gate = gate.lock().unwrap();
                if !gate.open {
                    gate.waker = Some(cx.waker().clone());
                    return Poll::Pending;
                }
            }
            Poll::Ready(Ok(()))
        }

        fn start_send(self: Pin<&mut Self>, item: Command) -> io::Result<()> {
            let remaining = self.fail_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected"));
            }
            self.sent.lock().unwrap().push(item);
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn numbered(n: i32) -> Command {
        Command::new("move").with("n", Value::I32(n))
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let sink = RecordingSink::new();
        let queue = SendQueue::new();
        queue.start(sink.clone()).await;

        for n in 0..10 {
            queue.push(numbered(n)).await.unwrap();
        }
        assert!(queue.stop(Duration::from_secs(1)).await);

        let sent = sink.sent();
        assert_eq!(sent.len(), 10);
        for (n, command) in sent.iter().enumerate() {
            assert_eq!(command.get_i32("n"), Some(n as i32));
        }
    }

    #[tokio::test]
    async fn test_push_requires_running_worker() {
        let queue = SendQueue::new();
        assert_eq!(
            queue.push(numbered(1)).await,
            Err(QueueError::NotRunning)
        );

        queue.start(RecordingSink::new()).await;
        queue.push(numbered(2)).await.unwrap();
        queue.stop(Duration::from_secs(1)).await;

        assert_eq!(
            queue.push(numbered(3)).await,
            Err(QueueError::NotRunning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retried_command_keeps_its_place() {
        let sink = RecordingSink::failing(2);
        let queue = SendQueue::new();
        queue.start(sink.clone()).await;

        queue.push(numbered(1)).await.unwrap();
        queue.push(numbered(2)).await.unwrap();
        assert!(queue.stop(Duration::from_secs(10)).await);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].get_i32("n"), Some(1));
        assert_eq!(sent[1].get_i32("n"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_dies_after_repeated_failures() {
        let sink = RecordingSink::failing(u32::MAX);
        let queue = SendQueue::new();
        queue.start(sink.clone()).await;
        queue.push(numbered(1)).await.unwrap();

        while queue.is_running() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(sink.sent().is_empty());
        assert_eq!(
            queue.push(numbered(2)).await,
            Err(QueueError::NotRunning)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_resolves_when_worker_dies() {
        let sink = RecordingSink::failing(u32::MAX);
        let queue = SendQueue::new();
        queue.start(sink.clone()).await;
        queue.push(numbered(1)).await.unwrap();

        tokio::time::timeout(Duration::from_secs(10), queue.closed())
            .await
            .expect("worker death never closed the queue");
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_closed_resolves_without_worker() {
        let queue = SendQueue::new();
        queue.closed().await;

        queue.start(RecordingSink::new()).await;
        queue.stop(Duration::from_secs(1)).await;
        queue.closed().await;
    }

    #[tokio::test]
    async fn test_clear_discards_pending_commands() {
        let sink = RecordingSink::gated();
        let queue = SendQueue::new();
        queue.start(sink.clone()).await;

        queue.push(numbered(1)).await.unwrap();
        queue.push(numbered(2)).await.unwrap();
        queue.push(numbered(3)).await.unwrap();

        // The worker is parked on the gate holding command 1; clearing
        // drops only what is still queued behind it.
        tokio::task::yield_now().await;
        queue.clear().await;
        sink.open_gate();
        assert!(queue.stop(Duration::from_secs(1)).await);

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].get_i32("n"), Some(1));
    }

    #[tokio::test]
    async fn test_command_pushed_after_clear_still_lands() {
        let sink = RecordingSink::gated();
        let queue = SendQueue::new();
        queue.start(sink.clone()).await;

        queue.push(numbered(1)).await.unwrap();
        tokio::task::yield_now().await;

        // Command 1 is held in flight on the gate. A clear at this
        // point must not touch anything pushed after it.
        queue.clear().await;
        queue.push(numbered(99)).await.unwrap();
        sink.open_gate();
        assert!(queue.stop(Duration::from_secs(1)).await);

        let sent = sink.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].get_i32("n"), Some(1));
        assert_eq!(sent[1].get_i32("n"), Some(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_hook_produces_keep_alives() {
        let sink = RecordingSink::new();
        let queue = SendQueue::new();
        queue
            .set_idle(
                Duration::from_millis(100),
                Box::new(|| Some(Command::new("__ping"))),
            )
            .await;
        queue.start(sink.clone()).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        queue.stop(Duration::from_secs(1)).await;

        let sent = sink.sent();
        assert!(sent.len() >= 2, "expected keep-alives, got {}", sent.len());
        assert!(sent.iter().all(|c| c.kind() == "__ping"));
    }
}
