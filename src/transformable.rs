// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Serialized application of operations with change notifications.
//!
//! A [`Transformable`] owns an [`ActionQueue`] bound to a [`Transform`] implementation and a
//! did-transform [`Notifier`]. Operations passed to [`Transformable::transform`] are applied in
//! order, one at a time; once applied, each resulting [`Transformed`] change is settled with the
//! did-transform listeners before `transform` returns.
//!
//! Applied changes wait in a single announcement queue shared by all callers, so listeners are
//! handed changes in the order they were applied even when several calls overlap.
use crate::{
    CacheError, Operation, Transformed,
    notifier::Notifier,
    queue::{ActionQueue, Interrupted, Perform},
};
use async_trait::async_trait;
use std::{
    collections::VecDeque,
    error::Error,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::oneshot;
use tracing::debug;

/// Errors raised while transforming a source.
#[derive(Debug, Clone)]
pub enum TransformError {
    Cache(CacheError),
    /// The operation was dropped from the queue before it was applied.
    Interrupted,
    /// A failure specific to the source implementation.
    Source(Arc<dyn Error + Send + Sync>),
}

impl TransformError {
    pub fn source_error(err: impl Error + Send + Sync + 'static) -> Self {
        Self::Source(Arc::new(err))
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::Cache(err) => write!(f, "{err}"),
            TransformError::Interrupted => write!(f, "{}", Interrupted),
            TransformError::Source(err) => write!(f, "source failed: {err}"),
        }
    }
}

impl Error for TransformError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            TransformError::Cache(err) => Some(err),
            TransformError::Interrupted => None,
            TransformError::Source(err) => Some(err.as_ref()),
        }
    }
}

impl From<CacheError> for TransformError {
    fn from(value: CacheError) -> Self {
        Self::Cache(value)
    }
}

impl From<Interrupted> for TransformError {
    fn from(_: Interrupted) -> Self {
        Self::Interrupted
    }
}

/// Applies a single operation to some state.
#[async_trait]
pub trait Transform: Send + Sync + 'static {
    /// Applies `operation` and returns every change it caused, each with its inverse.
    async fn apply(&self, operation: Operation) -> Result<Vec<Transformed>, TransformError>;
}

/// An applied change waiting for its did-transform listeners.
struct Announcement {
    change: Transformed,
    announced: oneshot::Sender<()>,
}

/// The outcome of applying one operation.
#[derive(Debug)]
pub struct Applied {
    inverse: Vec<Operation>,
    announced: Vec<oneshot::Receiver<()>>,
}

/// Performs queued operations against a [`Transform`].
pub struct Applier<T> {
    target: T,
    pending: Mutex<VecDeque<Announcement>>,
}

impl<T> Applier<T> {
    fn next_announcement(&self) -> Option<Announcement> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl<T: Transform> Perform for Applier<T> {
    type Item = Operation;
    type Output = Result<Applied, TransformError>;

    async fn perform(&self, operation: Operation) -> Self::Output {
        debug!(%operation, "applying");
        let changes = self.target.apply(operation).await?;
        let mut applied = Applied {
            inverse: Vec::new(),
            announced: Vec::with_capacity(changes.len()),
        };
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        for change in changes {
            let (announced, receiver) = oneshot::channel();
            applied.inverse.extend(change.inverse.iter().cloned());
            applied.announced.push(receiver);
            pending.push_back(Announcement { change, announced });
        }
        Ok(applied)
    }
}

pub struct Transformable<T: Transform> {
    queue: ActionQueue<Applier<T>>,
    did_transform: Notifier<Transformed>,
}

impl<T: Transform> fmt::Debug for Transformable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transformable")
            .field("queue", &self.queue)
            .field("did_transform", &self.did_transform)
            .finish()
    }
}

impl<T: Transform> Transformable<T> {
    pub fn new(target: T) -> Self {
        Self {
            queue: ActionQueue::new(Applier {
                target,
                pending: Mutex::new(VecDeque::new()),
            }),
            did_transform: Notifier::new(),
        }
    }

    pub fn target(&self) -> &T {
        &self.queue.performer().target
    }

    pub fn queue(&self) -> &ActionQueue<Applier<T>> {
        &self.queue
    }

    /// Listeners invoked with every change once it has been applied.
    pub fn did_transform(&self) -> &Notifier<Transformed> {
        &self.did_transform
    }

    pub fn is_processing(&self) -> bool {
        self.queue.is_processing()
    }

    pub async fn until_idle(&self) {
        self.queue.until_idle().await
    }

    /// Applies `operations` in order.
    ///
    /// Returns the inverses of all resulting changes, concatenated in the order the changes were
    /// applied. To undo the batch, apply them in reverse.
    ///
    /// An operation that fails does not stop the ones after it. The first failure is returned
    /// after all operations were attempted and all successful changes were settled.
    ///
    /// Settling drains the shared announcement queue front to back, which may include changes
    /// applied on behalf of an overlapping call.
    pub async fn transform(
        &self,
        operations: impl IntoIterator<Item = Operation>,
    ) -> Result<Vec<Operation>, TransformError> {
        let completions: Vec<_> = operations
            .into_iter()
            .map(|operation| self.queue.push(operation))
            .collect();
        if self.queue.auto_process() {
            self.queue.process().await;
        }

        let mut inverse = Vec::new();
        let mut announced = Vec::new();
        let mut failure = None;
        for completion in completions {
            match completion.await.map_err(TransformError::from).and_then(|applied| applied) {
                Ok(applied) => {
                    inverse.extend(applied.inverse);
                    announced.extend(applied.announced);
                }
                Err(err) => {
                    debug!(%err, "operation failed");
                    failure.get_or_insert(err);
                }
            }
        }

        self.announce().await;
        for signal in announced {
            // an error means the call announcing it was dropped
            let _ = signal.await;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(inverse),
        }
    }

    /// Settles pending changes until none are left.
    async fn announce(&self) {
        let applier = self.queue.performer();
        while let Some(Announcement { change, announced }) = applier.next_announcement() {
            self.did_transform.settle(change).await;
            let _ = announced.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Document, DocumentError};
    use serde_json::json;
    use tokio::sync::Notify;

    /// A document that only accepts operations below `/planet`.
    #[derive(Default)]
    struct Planets(Mutex<Document>);

    #[async_trait]
    impl Transform for Planets {
        async fn apply(&self, operation: Operation) -> Result<Vec<Transformed>, TransformError> {
            if operation.path().get(0) != Some("planet") {
                return Err(CacheError::OperationNotAllowed("planets only").into());
            }
            let inverse = self
                .0
                .lock()
                .unwrap()
                .transform(&operation, true)
                .map_err(CacheError::from)?
                .unwrap_or_default();
            Ok(vec![Transformed { operation, inverse }])
        }
    }

    fn transformable() -> Transformable<Planets> {
        let doc = Document::with_data(json!({"planet": {}}));
        Transformable::new(Planets(Mutex::new(doc)))
    }

    #[tokio::test]
    async fn returns_inverses_in_application_order() {
        let planets = transformable();
        let inverse = planets
            .transform([
                Operation::add("/planet/p1", json!({"name": "Mercury"})),
                Operation::replace("/planet/p1/name", json!("Venus")),
            ])
            .await
            .unwrap();
        assert_eq!(
            inverse,
            [
                Operation::remove("/planet/p1"),
                Operation::replace("/planet/p1/name", json!("Mercury")),
            ]
        );

        // undoing the batch takes the inverses in reverse
        planets.transform(inverse.into_iter().rev()).await.unwrap();
        assert_eq!(planets.target().0.lock().unwrap().root(), &json!({"planet": {}}));
    }

    #[tokio::test]
    async fn notifies_each_change_in_order() {
        let planets = transformable();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        planets.did_transform().add_listener(move |change: Transformed| {
            let log = log.clone();
            async move { log.lock().unwrap().push(change.operation.to_string()) }
        });
        planets
            .transform([
                Operation::add("/planet/p1", json!(1)),
                Operation::add("/planet/p2", json!(2)),
            ])
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), ["add /planet/p1 = 1", "add /planet/p2 = 2"]);
    }

    #[tokio::test]
    async fn overlapping_batches_are_announced_in_application_order() {
        let planets = Arc::new(transformable());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let (log, on_start, on_release) = (seen.clone(), started.clone(), release.clone());
        planets.did_transform().add_listener(move |change: Transformed| {
            let (log, started, release) = (log.clone(), on_start.clone(), on_release.clone());
            async move {
                let change = change.operation.to_string();
                log.lock().unwrap().push(change.clone());
                if change == "add /planet/p1 = 1" {
                    started.notify_one();
                    release.notified().await;
                }
            }
        });

        let first = tokio::spawn({
            let planets = planets.clone();
            async move {
                planets
                    .transform([
                        Operation::add("/planet/p1", json!(1)),
                        Operation::add("/planet/p2", json!(2)),
                    ])
                    .await
            }
        });
        // the first batch is applied and stuck announcing p1
        started.notified().await;
        planets
            .transform([Operation::add("/planet/p3", json!(3))])
            .await
            .unwrap();
        release.notify_one();
        first.await.unwrap().unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            ["add /planet/p1 = 1", "add /planet/p2 = 2", "add /planet/p3 = 3"]
        );
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_batch() {
        let planets = transformable();
        let result = planets
            .transform([
                Operation::add("/moon/m1", json!(1)),
                Operation::remove("/planet/missing"),
                Operation::add("/planet/p1", json!(1)),
            ])
            .await;
        assert!(matches!(
            result,
            Err(TransformError::Cache(CacheError::OperationNotAllowed(_)))
        ));
        assert_eq!(
            planets.target().0.lock().unwrap().root(),
            &json!({"planet": {"p1": 1}})
        );

        let missing = planets.transform([Operation::remove("/planet/missing")]).await;
        assert!(matches!(
            missing,
            Err(TransformError::Cache(CacheError::Document(DocumentError::PathNotFound(_))))
        ));
        assert!(!planets.is_processing());
    }
}
