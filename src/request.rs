// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Record-level requests and the pipeline that answers them.
//!
//! A [`Requestable`] answers a [`Request`] in four steps:
//!
//! 1. every registered [assist](Stage::Assist) handler is tried in registration order, the first
//!    one that succeeds answers the request;
//! 2. otherwise the requestable [handles](Requestable::handle) the request itself;
//! 3. if that fails, every [rescue](Stage::Rescue) handler is tried the same way, and if none
//!    succeeds the local failure stands;
//! 4. the outcome is settled with the [`did`](RequestHandlers::did) or
//!    [`did_not`](RequestHandlers::did_not) listeners before it is returned.
//!
//! Handlers decide for themselves which requests they care about: returning `None` passes.
use crate::{
    CacheError, Path, TransformError, notifier::Notifier, schema::UnknownModel,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};
use tracing::debug;

/// Selects the records a [`Request::Find`] returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Selector {
    /// Every record of the model.
    All,
    Id(String),
    /// Fails unless every id is found.
    Ids(Vec<String>),
    /// Records whose members equal all of the given ones.
    Matching(Map<String, Value>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    Find {
        model: String,
        selector: Selector,
    },
    /// Adds a new record, initializing its id and defaults if it has no id yet.
    Add {
        model: String,
        data: Map<String, Value>,
    },
    /// Replaces an existing record.
    Update {
        model: String,
        data: Map<String, Value>,
    },
    /// Replaces the value at `field` within a record.
    Patch {
        model: String,
        id: String,
        field: Path,
        value: Value,
    },
    Remove {
        model: String,
        id: String,
    },
    AddLink {
        model: String,
        id: String,
        link: String,
        related: String,
    },
    /// Removes a link. `related` may be omitted for `hasOne` links.
    RemoveLink {
        model: String,
        id: String,
        link: String,
        #[serde(default)]
        related: Option<String>,
    },
    FindLink {
        model: String,
        id: String,
        link: String,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Find,
    Add,
    Update,
    Patch,
    Remove,
    AddLink,
    RemoveLink,
    FindLink,
}

impl RequestKind {
    pub const ALL: [RequestKind; 8] = [
        RequestKind::Find,
        RequestKind::Add,
        RequestKind::Update,
        RequestKind::Patch,
        RequestKind::Remove,
        RequestKind::AddLink,
        RequestKind::RemoveLink,
        RequestKind::FindLink,
    ];
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RequestKind::Find => "find",
            RequestKind::Add => "add",
            RequestKind::Update => "update",
            RequestKind::Patch => "patch",
            RequestKind::Remove => "remove",
            RequestKind::AddLink => "addLink",
            RequestKind::RemoveLink => "removeLink",
            RequestKind::FindLink => "findLink",
        })
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::Find { .. } => RequestKind::Find,
            Request::Add { .. } => RequestKind::Add,
            Request::Update { .. } => RequestKind::Update,
            Request::Patch { .. } => RequestKind::Patch,
            Request::Remove { .. } => RequestKind::Remove,
            Request::AddLink { .. } => RequestKind::AddLink,
            Request::RemoveLink { .. } => RequestKind::RemoveLink,
            Request::FindLink { .. } => RequestKind::FindLink,
        }
    }

    /// The model the request addresses.
    pub fn model(&self) -> &str {
        match self {
            Request::Find { model, .. }
            | Request::Add { model, .. }
            | Request::Update { model, .. }
            | Request::Patch { model, .. }
            | Request::Remove { model, .. }
            | Request::AddLink { model, .. }
            | Request::RemoveLink { model, .. }
            | Request::FindLink { model, .. } => model,
        }
    }
}

/// Errors a request can be answered with.
#[derive(Debug, Clone)]
pub enum RequestError {
    RecordNotFound {
        model: String,
        ids: Vec<String>,
    },
    /// The record exists but the link is empty or points at records that do not.
    LinkNotFound {
        model: String,
        id: String,
        link: String,
    },
    RecordAlreadyExists {
        model: String,
        id: String,
    },
    /// The schema declares no such link on the model.
    UnknownLink {
        model: String,
        link: String,
    },
    Transform(TransformError),
}

impl RequestError {
    pub(crate) fn record_not_found(model: &str, id: &str) -> Self {
        Self::RecordNotFound {
            model: model.to_string(),
            ids: vec![id.to_string()],
        }
    }
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::RecordNotFound { model, ids } => {
                write!(f, "record not found: {model} {}", ids.join(", "))
            }
            RequestError::LinkNotFound { model, id, link } => {
                write!(f, "link not found: {model} {id} {link}")
            }
            RequestError::RecordAlreadyExists { model, id } => {
                write!(f, "record already exists: {model} {id}")
            }
            RequestError::UnknownLink { model, link } => {
                write!(f, "model {model} has no link {link}")
            }
            RequestError::Transform(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Transform(err) => Some(err),
            _ => None,
        }
    }
}

impl From<TransformError> for RequestError {
    fn from(value: TransformError) -> Self {
        Self::Transform(value)
    }
}

impl From<CacheError> for RequestError {
    fn from(value: CacheError) -> Self {
        Self::Transform(value.into())
    }
}

impl From<UnknownModel> for RequestError {
    fn from(value: UnknownModel) -> Self {
        CacheError::from(value).into()
    }
}

/// When a handler is consulted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// Before the requestable handles the request itself.
    Assist,
    /// After the requestable failed to handle the request.
    #[default]
    Rescue,
}

pub type RequestFuture = BoxFuture<'static, Result<Value, RequestError>>;

type Handler = Arc<dyn Fn(&Request) -> Option<RequestFuture> + Send + Sync>;

/// Identifies a registered handler, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// The handlers and listeners of one [`Requestable`].
#[derive(Default)]
pub struct RequestHandlers {
    assist: Mutex<Vec<(HandlerId, Handler)>>,
    rescue: Mutex<Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
    did: Notifier<(Request, Value)>,
    did_not: Notifier<(Request, RequestError)>,
}

impl fmt::Debug for RequestHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandlers")
            .field("assist", &self.stage(Stage::Assist).len())
            .field("rescue", &self.stage(Stage::Rescue).len())
            .field("did", &self.did)
            .field("did_not", &self.did_not)
            .finish_non_exhaustive()
    }
}

impl RequestHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler<F>(&self, stage: Stage, handler: F) -> HandlerId
    where
        F: Fn(&Request) -> Option<RequestFuture> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.stage(stage).push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the handler was not registered.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        [Stage::Assist, Stage::Rescue].into_iter().any(|stage| {
            let mut handlers = self.stage(stage);
            let before = handlers.len();
            handlers.retain(|(handler, _)| *handler != id);
            handlers.len() != before
        })
    }

    /// Listeners invoked with every request that succeeded, and its result.
    pub fn did(&self) -> &Notifier<(Request, Value)> {
        &self.did
    }

    /// Listeners invoked with every request that failed, and the failure.
    pub fn did_not(&self) -> &Notifier<(Request, RequestError)> {
        &self.did_not
    }

    /// Tries the handlers of `stage` in order, returning the first success.
    ///
    /// `None` if no handler took the request or all of them failed.
    async fn resolve(&self, stage: Stage, request: &Request) -> Option<Value> {
        let handlers: Vec<_> = self
            .stage(stage)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            let Some(answer) = handler(request) else {
                continue;
            };
            match answer.await {
                Ok(value) => return Some(value),
                Err(err) => debug!(?stage, kind = %request.kind(), %err, "handler failed"),
            }
        }
        None
    }

    fn stage(&self, stage: Stage) -> MutexGuard<'_, Vec<(HandlerId, Handler)>> {
        let handlers = match stage {
            Stage::Assist => &self.assist,
            Stage::Rescue => &self.rescue,
        };
        handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Something that answers [`Request`]s.
#[async_trait]
pub trait Requestable: Send + Sync {
    fn handlers(&self) -> &RequestHandlers;

    /// Answers `request` locally, without consulting any handler.
    async fn handle(&self, request: Request) -> Result<Value, RequestError>;

    /// Answers `request` through the assist, local and rescue stages and settles the outcome.
    async fn request(&self, request: Request) -> Result<Value, RequestError> {
        let handlers = self.handlers();
        let result = match handlers.resolve(Stage::Assist, &request).await {
            Some(value) => Ok(value),
            None => self.handle(request.clone()).await,
        };
        let result = match result {
            Err(err) => handlers
                .resolve(Stage::Rescue, &request)
                .await
                .ok_or(err),
            ok => ok,
        };
        match &result {
            Ok(value) => handlers.did().settle((request, value.clone())).await,
            Err(err) => handlers.did_not().settle((request, err.clone())).await,
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use serde_json::json;

    /// Knows a single planet and fails everything else.
    #[derive(Default)]
    struct Mercury {
        handlers: RequestHandlers,
    }

    #[async_trait]
    impl Requestable for Mercury {
        fn handlers(&self) -> &RequestHandlers {
            &self.handlers
        }

        async fn handle(&self, request: Request) -> Result<Value, RequestError> {
            match request {
                Request::Find {
                    selector: Selector::Id(id),
                    ..
                } if id == "p1" => Ok(json!({"name": "Mercury"})),
                Request::Find {
                    model,
                    selector: Selector::Id(id),
                } => Err(RequestError::record_not_found(&model, &id)),
                request => Err(RequestError::UnknownLink {
                    model: request.model().to_string(),
                    link: request.kind().to_string(),
                }),
            }
        }
    }

    fn find(id: &str) -> Request {
        Request::Find {
            model: "planet".to_string(),
            selector: Selector::Id(id.to_string()),
        }
    }

    fn answer(value: Value) -> Option<RequestFuture> {
        Some(async move { Ok(value) }.boxed())
    }

    #[tokio::test]
    async fn handles_locally_without_handlers() {
        let mercury = Mercury::default();
        assert_eq!(mercury.request(find("p1")).await.unwrap(), json!({"name": "Mercury"}));
        assert!(matches!(
            mercury.request(find("p2")).await,
            Err(RequestError::RecordNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn first_successful_assist_wins() {
        let mercury = Mercury::default();
        mercury.handlers().add_handler(Stage::Assist, |_| {
            Some(async { Err(RequestError::record_not_found("planet", "p1")) }.boxed())
        });
        mercury.handlers().add_handler(Stage::Assist, |_| None);
        mercury
            .handlers()
            .add_handler(Stage::Assist, |_| answer(json!("assisted")));
        mercury
            .handlers()
            .add_handler(Stage::Assist, |_| answer(json!("too late")));
        assert_eq!(mercury.request(find("p1")).await.unwrap(), json!("assisted"));
    }

    #[tokio::test]
    async fn rescue_only_runs_on_failure() {
        let mercury = Mercury::default();
        let id = mercury.handlers().add_handler(Stage::Rescue, |request| match request {
            Request::Find {
                selector: Selector::Id(id),
                ..
            } => answer(json!({"name": format!("rescued {id}")})),
            _ => None,
        });
        assert_eq!(mercury.request(find("p1")).await.unwrap(), json!({"name": "Mercury"}));
        assert_eq!(
            mercury.request(find("p2")).await.unwrap(),
            json!({"name": "rescued p2"})
        );

        assert!(mercury.handlers().remove_handler(id));
        assert!(!mercury.handlers().remove_handler(id));
        assert!(mercury.request(find("p2")).await.is_err());
    }

    #[tokio::test]
    async fn settles_outcomes() {
        let mercury = Mercury::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let did = log.clone();
        mercury.handlers().did().add_listener(move |(request, value): (Request, Value)| {
            let log = did.clone();
            async move { log.lock().unwrap().push(format!("did {} {value}", request.kind())) }
        });
        let did_not = log.clone();
        mercury
            .handlers()
            .did_not()
            .add_listener(move |(request, err): (Request, RequestError)| {
                let log = did_not.clone();
                async move { log.lock().unwrap().push(format!("did not {} ({err})", request.kind())) }
            });

        mercury.request(find("p1")).await.unwrap();
        mercury.request(find("p2")).await.unwrap_err();
        assert_eq!(
            *log.lock().unwrap(),
            [
                r#"did find {"name":"Mercury"}"#,
                "did not find (record not found: planet p2)",
            ]
        );
    }

    #[test]
    fn request_wire_shape() {
        let request = Request::AddLink {
            model: "moon".to_string(),
            id: "m1".to_string(),
            link: "planet".to_string(),
            related: "p1".to_string(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"action": "addLink", "model": "moon", "id": "m1", "link": "planet", "related": "p1"})
        );
        assert_eq!(serde_json::from_value::<Request>(json).unwrap(), request);

        let find: Request = serde_json::from_value(
            json!({"action": "find", "model": "planet", "selector": {"ids": ["p1", "p2"]}}),
        )
        .unwrap();
        assert_eq!(find.kind(), RequestKind::Find);
        assert_eq!(find.model(), "planet");
    }
}
