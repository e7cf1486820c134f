// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Lets one requestable source help another answer requests.
//!
//! A [`RequestConnector`] registers the secondary source as a handler on the primary. In
//! [`Stage::Assist`] mode the secondary is asked before the primary handles the request itself,
//! in [`Stage::Rescue`] mode only after the primary failed. Only requests whose kind and model
//! match the connector's options are passed on.
use crate::request::{HandlerId, Request, RequestKind, Requestable, Stage};
use futures::FutureExt;
use serde::Deserialize;
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestConnectorOptions {
    /// Whether the secondary is asked before the primary or only when the primary fails.
    pub mode: Stage,
    /// The kinds of requests passed on.
    pub kinds: Vec<RequestKind>,
    /// The models whose requests are passed on; all of them if `None`.
    pub models: Option<Vec<String>>,
    pub active: bool,
}

impl Default for RequestConnectorOptions {
    fn default() -> Self {
        Self {
            mode: Stage::Rescue,
            kinds: RequestKind::ALL.to_vec(),
            models: None,
            active: true,
        }
    }
}

impl RequestConnectorOptions {
    pub fn assist() -> Self {
        Self {
            mode: Stage::Assist,
            ..Self::default()
        }
    }

    pub fn rescue() -> Self {
        Self::default()
    }

    pub fn with_kinds(mut self, kinds: impl IntoIterator<Item = RequestKind>) -> Self {
        self.kinds = kinds.into_iter().collect();
        self
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = Some(models.into_iter().map(Into::into).collect());
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    fn passes_on(&self, request: &Request) -> bool {
        self.kinds.contains(&request.kind())
            && self
                .models
                .as_ref()
                .is_none_or(|models| models.iter().any(|model| model == request.model()))
    }
}

/// Passes the requests of a primary requestable on to a secondary one.
///
/// The secondary answers through its own [`Requestable::request`] pipeline, so connecting two
/// requestables to each other in rescue mode makes a request both of them fail loop forever.
pub struct RequestConnector {
    primary: Arc<dyn Requestable>,
    secondary: Arc<dyn Requestable>,
    options: Arc<RequestConnectorOptions>,
    handler: Mutex<Option<HandlerId>>,
}

impl fmt::Debug for RequestConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestConnector")
            .field("options", &self.options)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl RequestConnector {
    pub fn new(
        primary: Arc<dyn Requestable>,
        secondary: Arc<dyn Requestable>,
        options: RequestConnectorOptions,
    ) -> Self {
        let connector = Self {
            primary,
            secondary,
            options: Arc::new(options),
            handler: Mutex::new(None),
        };
        if connector.options.active {
            connector.activate();
        }
        connector
    }

    pub fn options(&self) -> &RequestConnectorOptions {
        &self.options
    }

    pub fn is_active(&self) -> bool {
        self.handler().is_some()
    }

    /// Registers the secondary with the primary. Does nothing if already active.
    pub fn activate(&self) {
        let mut handler = self.handler();
        if handler.is_some() {
            return;
        }
        let secondary = Arc::clone(&self.secondary);
        let options = Arc::clone(&self.options);
        let id = self
            .primary
            .handlers()
            .add_handler(self.options.mode, move |request| {
                if !options.passes_on(request) {
                    return None;
                }
                let secondary = Arc::clone(&secondary);
                let request = request.clone();
                Some(async move { secondary.request(request).await }.boxed())
            });
        *handler = Some(id);
        debug!(mode = ?self.options.mode, "request connector activated");
    }

    /// Unregisters the secondary. Does nothing if not active.
    pub fn deactivate(&self) {
        if let Some(id) = self.handler().take() {
            self.primary.handlers().remove_handler(id);
            debug!("request connector deactivated");
        }
    }

    fn handler(&self) -> MutexGuard<'_, Option<HandlerId>> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RequestConnector {
    fn drop(&mut self) {
        self.deactivate();
    }
}
