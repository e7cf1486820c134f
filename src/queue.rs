// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! A FIFO queue that performs its items one at a time.
//!
//! Items are handed to a [`Perform`] implementation strictly in the order they were pushed, and
//! the next item only starts once the previous one has finished, whether it succeeded or not.
//! Every item pushed gets a [`Completion`] resolving to its output.
//!
//! The queue does not own a task. It is drained by whoever calls [`ActionQueue::process`] (or
//! [`ActionQueue::submit`]); concurrent callers find it busy and simply wait for their items.
//!
//! ```rust
//! # use patchsync::queue::{ActionQueue, Perform};
//! struct Double;
//!
//! #[async_trait::async_trait]
//! impl Perform for Double {
//!     type Item = u32;
//!     type Output = u32;
//!
//!     async fn perform(&self, item: u32) -> u32 {
//!         item * 2
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let queue = ActionQueue::new(Double);
//! let first = queue.push(1);
//! let second = queue.push(2);
//! queue.process().await;
//! assert_eq!(first.await, Ok(2));
//! assert_eq!(second.await, Ok(4));
//! assert_eq!(queue.submit(3).await, Ok(6));
//! # });
//! ```
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    fmt,
    future::Future,
    pin::Pin,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};
use tokio::sync::{oneshot, watch};
use tracing::debug;

/// The action run for each queued item.
#[async_trait]
pub trait Perform: Send + Sync + 'static {
    type Item: Send + 'static;
    type Output: Send + 'static;

    async fn perform(&self, item: Self::Item) -> Self::Output;
}

/// Returned by a [`Completion`] whose item will never be performed, because the future draining
/// the queue was dropped while performing it or the queue itself was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupted;

impl fmt::Display for Interrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queued item was interrupted before completing")
    }
}

impl std::error::Error for Interrupted {}

/// Resolves to the output of a queued item once it has been performed.
#[must_use = "completions do nothing unless awaited"]
pub struct Completion<O> {
    receiver: oneshot::Receiver<O>,
}

impl<O> Future for Completion<O> {
    type Output = Result<O, Interrupted>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| Interrupted))
    }
}

struct Entry<P: Perform> {
    item: P::Item,
    done: oneshot::Sender<P::Output>,
}

struct State<P: Perform> {
    entries: VecDeque<Entry<P>>,
    processing: bool,
}

pub struct ActionQueue<P: Perform> {
    performer: P,
    state: Mutex<State<P>>,
    busy: watch::Sender<bool>,
    auto_process: AtomicBool,
}

impl<P: Perform> fmt::Debug for ActionQueue<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("ActionQueue")
            .field("len", &state.entries.len())
            .field("processing", &state.processing)
            .finish_non_exhaustive()
    }
}

impl<P: Perform> ActionQueue<P> {
    /// Creates an empty queue that processes items as they are submitted.
    pub fn new(performer: P) -> Self {
        Self {
            performer,
            state: Mutex::new(State {
                entries: VecDeque::new(),
                processing: false,
            }),
            busy: watch::Sender::new(false),
            auto_process: AtomicBool::new(true),
        }
    }

    pub fn performer(&self) -> &P {
        &self.performer
    }

    /// Whether [`submit`](Self::submit) starts processing on its own.
    pub fn auto_process(&self) -> bool {
        self.auto_process.load(Ordering::Acquire)
    }

    pub fn set_auto_process(&self, auto_process: bool) {
        self.auto_process.store(auto_process, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true while an item is being performed.
    pub fn is_processing(&self) -> bool {
        self.lock().processing
    }

    /// Appends `item` without performing it.
    pub fn push(&self, item: P::Item) -> Completion<P::Output> {
        let (done, receiver) = oneshot::channel();
        self.lock().entries.push_back(Entry { item, done });
        Completion { receiver }
    }

    /// Appends `item`, processes the queue if auto-processing is on, and waits for the output.
    pub async fn submit(&self, item: P::Item) -> Result<P::Output, Interrupted> {
        let completion = self.push(item);
        if self.auto_process() {
            self.process().await;
        }
        completion.await
    }

    /// Performs queued items in order until the queue is empty.
    ///
    /// Returns immediately if the queue is already being processed. If this future is dropped
    /// while an item is being performed, that item's completion resolves to [`Interrupted`]
    /// and the remaining items wait for the next call.
    pub async fn process(&self) {
        {
            let mut state = self.lock();
            if state.processing || state.entries.is_empty() {
                return;
            }
            state.processing = true;
            self.busy.send_replace(true);
        }
        debug!(len = self.len(), "processing queue");

        let mut guard = ProcessingGuard {
            queue: self,
            finished: false,
        };
        loop {
            let entry = {
                let mut state = self.lock();
                match state.entries.pop_front() {
                    Some(entry) => entry,
                    None => {
                        // flipped under the lock so that a concurrent push is never stranded
                        state.processing = false;
                        self.busy.send_replace(false);
                        break;
                    }
                }
            };
            let output = self.performer.perform(entry.item).await;
            // the waiter may have given up, which is fine
            let _ = entry.done.send(output);
        }
        guard.finished = true;
        debug!("queue drained");
    }

    /// Waits until the queue is not being processed.
    pub async fn until_idle(&self) {
        let mut busy = self.busy.subscribe();
        // the sender lives as long as `self`, so this cannot fail
        let _ = busy.wait_for(|busy| !*busy).await;
    }

    fn lock(&self) -> MutexGuard<'_, State<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Leaves the queue idle if processing stops early.
struct ProcessingGuard<'a, P: Perform> {
    queue: &'a ActionQueue<P>,
    finished: bool,
}

impl<P: Perform> Drop for ProcessingGuard<'_, P> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("queue processing interrupted");
            self.queue.lock().processing = false;
            self.queue.busy.send_replace(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, time::Duration};

    /// Records the order items are performed in; item 1 takes a while.
    #[derive(Default)]
    struct Recorder {
        performed: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Perform for Arc<Recorder> {
        type Item = u32;
        type Output = Result<u32, String>;

        async fn perform(&self, item: u32) -> Result<u32, String> {
            if item == 1 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            self.performed.lock().unwrap().push(item);
            if item == 2 {
                return Err("two is not welcome".to_string());
            }
            Ok(item)
        }
    }

    #[tokio::test]
    async fn fifo_even_when_an_item_is_slow() {
        let recorder = Arc::new(Recorder::default());
        let queue = ActionQueue::new(recorder.clone());
        let completions: Vec<_> = [1, 2, 3].into_iter().map(|item| queue.push(item)).collect();
        assert_eq!(queue.len(), 3);
        queue.process().await;
        assert_eq!(*recorder.performed.lock().unwrap(), [1, 2, 3]);

        let outputs = futures::future::join_all(completions).await;
        assert_eq!(
            outputs,
            [Ok(Ok(1)), Ok(Err("two is not welcome".to_string())), Ok(Ok(3))]
        );
        assert!(queue.is_empty());
        assert!(!queue.is_processing());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_submitters_share_one_drain() {
        let recorder = Arc::new(Recorder::default());
        let queue = Arc::new(ActionQueue::new(recorder.clone()));
        let slow = tokio::spawn({
            let queue = queue.clone();
            async move { queue.submit(1).await }
        });
        // wait for the slow item to start
        while !queue.is_processing() {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.submit(3).await, Ok(Ok(3)));
        assert_eq!(slow.await.unwrap(), Ok(Ok(1)));
        assert_eq!(*recorder.performed.lock().unwrap(), [1, 3]);
    }

    #[tokio::test]
    async fn manual_processing() {
        let queue = ActionQueue::new(Arc::new(Recorder::default()));
        queue.set_auto_process(false);
        let completion = queue.push(5);
        let submitted = queue.push(6);
        assert_eq!(queue.len(), 2);
        queue.process().await;
        assert_eq!(completion.await, Ok(Ok(5)));
        assert_eq!(submitted.await, Ok(Ok(6)));
    }

    #[tokio::test]
    async fn dropped_drain_interrupts_the_current_item() {
        let recorder = Arc::new(Recorder::default());
        let queue = ActionQueue::new(recorder.clone());
        let slow = queue.push(1);
        let next = queue.push(3);
        let timed_out = tokio::time::timeout(Duration::from_millis(1), queue.process()).await;
        assert!(timed_out.is_err());
        assert_eq!(slow.await, Err(Interrupted));
        assert!(!queue.is_processing());
        assert_eq!(queue.len(), 1);

        queue.process().await;
        assert_eq!(next.await, Ok(Ok(3)));
        assert_eq!(*recorder.performed.lock().unwrap(), [3]);
    }

    #[tokio::test]
    async fn until_idle_waits_for_the_drain() {
        let queue = Arc::new(ActionQueue::new(Arc::new(Recorder::default())));
        queue.until_idle().await;
        let completion = queue.push(1);
        let drain = tokio::spawn({
            let queue = queue.clone();
            async move { queue.process().await }
        });
        while !queue.is_processing() {
            tokio::task::yield_now().await;
        }
        queue.until_idle().await;
        assert!(queue.is_empty());
        assert_eq!(completion.await, Ok(Ok(1)));
        drain.await.unwrap();
    }
}
