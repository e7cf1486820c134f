// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Replays the changes of one source onto another.
//!
//! For every change the source announces, the connector looks at what the target currently
//! holds at the changed path:
//!
//! - a record the target removed is left alone;
//! - an `add` or `replace` of a value the target already holds is skipped, which is what keeps
//!   two sources connected both ways from echoing changes back and forth;
//! - an `add` or `replace` of a value that differs from the target's is merged in at field level:
//!   the connector applies the [diff](crate::diff::diffs) between the two, keeping members only
//!   the target has and ignoring the reverse link index;
//! - a `remove` of something the target does not hold is skipped;
//! - anything else is applied verbatim.
//!
//! While the target is busy applying operations, replication is deferred to a queue owned by
//! the connector, which waits for the target to become idle before each replay so that the
//! merge is computed against settled state.
use crate::{
    Operation, TransformError, Transformed,
    diff::{DiffOptions, diffs},
    notifier::ListenerId,
    operation::OperationKind,
    queue::{ActionQueue, Perform},
    schema::REV_LINKS_FIELD,
    source::Source,
    value,
};
use async_trait::async_trait;
use futures::{FutureExt, future};
use serde::Deserialize;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorOptions {
    /// Replicate each change before the source's `transform` call returns, rather than in a
    /// spawned task.
    pub blocking: bool,
    /// Start observing the source right away.
    pub active: bool,
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        Self {
            blocking: true,
            active: true,
        }
    }
}

impl ConnectorOptions {
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }
}

/// Replays operations once the target is idle.
struct Deferred {
    target: Arc<dyn Source>,
}

#[async_trait]
impl Perform for Deferred {
    type Item = Operation;
    type Output = Result<Vec<Operation>, TransformError>;

    async fn perform(&self, operation: Operation) -> Self::Output {
        self.target.until_idle().await;
        replicate(self.target.as_ref(), operation).await
    }
}

/// The part of a connector its listener shares.
struct Replication {
    target: Arc<dyn Source>,
    deferred: ActionQueue<Deferred>,
}

impl Replication {
    async fn observe(&self, operation: Operation) {
        let busy =
            self.target.is_processing() || self.deferred.is_processing() || !self.deferred.is_empty();
        let result = if busy {
            debug!(%operation, "target busy, deferring replication");
            match self.deferred.submit(operation).await {
                Ok(result) => result,
                Err(interrupted) => Err(interrupted.into()),
            }
        } else {
            replicate(self.target.as_ref(), operation).await
        };
        if let Err(err) = result {
            warn!(%err, "replication failed");
        }
    }
}

/// Applies `operation` to `target`, reconciling it with what the target holds.
///
/// Returns the inverses of the changes made to the target.
async fn replicate(
    target: &dyn Source,
    operation: Operation,
) -> Result<Vec<Operation>, TransformError> {
    let path = operation.path();
    if target.is_deleted(path) {
        debug!(%operation, "skipping, target removed the record");
        return Ok(Vec::new());
    }

    let current = if target.supports_retrieve() {
        target.retrieve(path)
    } else {
        None
    };
    if let Some(current) = &current {
        if let (OperationKind::Add | OperationKind::Replace, Some(incoming)) =
            (operation.kind(), operation.value())
        {
            if value::eq(current, incoming) {
                debug!(%operation, "skipping, target already holds the value");
                return Ok(Vec::new());
            }
            let options = DiffOptions::new(path.clone())
                .ignore([REV_LINKS_FIELD])
                .retain_unmatched();
            return match diffs(current, incoming, &options) {
                Some(patch) => {
                    debug!(%operation, len = patch.len(), "merging into diverged target");
                    target.transform(patch).await
                }
                None => {
                    debug!(%operation, "skipping, nothing to merge");
                    Ok(Vec::new())
                }
            };
        }
    } else if operation.kind() == OperationKind::Remove && target.supports_retrieve() {
        debug!(%operation, "skipping, target does not hold the value");
        return Ok(Vec::new());
    }

    target.transform(vec![operation]).await
}

/// Observes a source and replays its changes onto a target.
pub struct TransformConnector {
    source: Arc<dyn Source>,
    replication: Arc<Replication>,
    options: ConnectorOptions,
    listener: Mutex<Option<ListenerId>>,
}

impl fmt::Debug for TransformConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformConnector")
            .field("options", &self.options)
            .field("active", &self.is_active())
            .field("deferred", &self.replication.deferred)
            .finish_non_exhaustive()
    }
}

impl TransformConnector {
    /// Connects `source` to `target`, activating the connector unless
    /// [`ConnectorOptions::active`] is false.
    ///
    /// # Panics
    ///
    /// A non-blocking connector spawns a Tokio task per change, so the source must only be
    /// transformed from within a Tokio runtime while such a connector is active.
    pub fn new(source: Arc<dyn Source>, target: Arc<dyn Source>, options: ConnectorOptions) -> Self {
        let connector = Self {
            source,
            replication: Arc::new(Replication {
                deferred: ActionQueue::new(Deferred {
                    target: Arc::clone(&target),
                }),
                target,
            }),
            options,
            listener: Mutex::new(None),
        };
        if options.active {
            connector.activate();
        }
        connector
    }

    pub fn source(&self) -> &Arc<dyn Source> {
        &self.source
    }

    pub fn target(&self) -> &Arc<dyn Source> {
        &self.replication.target
    }

    pub fn options(&self) -> &ConnectorOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.listener().is_some()
    }

    /// Starts observing the source. Does nothing if already active.
    pub fn activate(&self) {
        let mut listener = self.listener();
        if listener.is_some() {
            return;
        }
        let replication = Arc::clone(&self.replication);
        let blocking = self.options.blocking;
        let id = self.source.did_transform().add_listener(move |change: Transformed| {
            let replication = Arc::clone(&replication);
            let replay = async move { replication.observe(change.operation).await };
            if blocking {
                replay.boxed()
            } else {
                tokio::spawn(replay);
                future::ready(()).boxed()
            }
        });
        *listener = Some(id);
        debug!(blocking, "transform connector activated");
    }

    /// Stops observing the source. Does nothing if not active.
    ///
    /// Replication that is already under way still completes.
    pub fn deactivate(&self) {
        if let Some(id) = self.listener().take() {
            self.source.did_transform().remove_listener(id);
            debug!("transform connector deactivated");
        }
    }

    fn listener(&self) -> MutexGuard<'_, Option<ListenerId>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TransformConnector {
    fn drop(&mut self) {
        self.deactivate();
    }
}
