// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Undoable groups of changes.
//!
//! A [`Transaction`] records every change a [`Source`] announces while it is active, whoever
//! made the change. [`Transaction::commit`] stops recording and keeps the changes;
//! [`Transaction::rollback`] stops recording and undoes them by applying their inverses,
//! latest change first.
//!
//! ```rust
//! # use patchsync::{CacheOptions, Operation, path, schema::{ModelDef, Schema}};
//! # use patchsync::{source::MemorySource, transaction::Transaction};
//! # use serde_json::json;
//! # use std::sync::Arc;
//! # tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(async {
//! let schema = Schema::new().with_model("planet", ModelDef::default());
//! let source = Arc::new(MemorySource::new(schema, CacheOptions::default()));
//!
//! let tx = Transaction::begin(source.clone());
//! source
//!     .transform([Operation::add(path!("planet", "p1"), json!({"name": "Mercury"}))])
//!     .await?;
//! assert_eq!(tx.len(), 1);
//!
//! tx.rollback().await?;
//! assert_eq!(source.retrieve(&path!("planet", "p1")), None);
//! # Ok::<_, patchsync::TransformError>(())
//! # }).unwrap();
//! ```
use crate::{Operation, TransformError, Transformed, notifier::ListenerId, source::Source};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

pub struct Transaction {
    source: Arc<dyn Source>,
    recorded: Arc<Mutex<Vec<Transformed>>>,
    listener: Mutex<Option<ListenerId>>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("active", &self.is_active())
            .field("recorded", &*lock(&self.recorded))
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transaction {
    /// Starts recording the changes of `source`.
    pub fn begin(source: Arc<dyn Source>) -> Self {
        let recorded = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&recorded);
        let id = source.did_transform().add_listener(move |change: Transformed| {
            lock(&log).push(change);
            async {}
        });
        Self {
            source,
            recorded,
            listener: Mutex::new(Some(id)),
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.listener).is_some()
    }

    /// The number of changes recorded so far.
    pub fn len(&self) -> usize {
        lock(&self.recorded).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The recorded operations, in the order they were applied.
    pub fn operations(&self) -> Vec<Operation> {
        lock(&self.recorded)
            .iter()
            .map(|change| change.operation.clone())
            .collect()
    }

    /// The operations that undo everything recorded so far, in the order they must be applied.
    pub fn inverse(&self) -> Vec<Operation> {
        lock(&self.recorded)
            .iter()
            .rev()
            .flat_map(|change| change.inverse.iter().cloned())
            .collect()
    }

    /// Stops recording and returns the recorded changes.
    pub fn commit(self) -> Vec<Transformed> {
        self.stop();
        std::mem::take(&mut *lock(&self.recorded))
    }

    /// Stops recording and undoes the recorded changes.
    ///
    /// The undo is itself announced by the source like any other change.
    pub async fn rollback(self) -> Result<(), TransformError> {
        self.stop();
        let inverse = self.inverse();
        debug!(len = inverse.len(), "rolling back transaction");
        if inverse.is_empty() {
            return Ok(());
        }
        self.source.transform(inverse).await?;
        Ok(())
    }

    fn stop(&self) {
        if let Some(id) = lock(&self.listener).take() {
            self.source.did_transform().remove_listener(id);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.stop();
    }
}
