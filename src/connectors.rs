// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Connectors keep replicas in step.
//!
//! - **[`TransformConnector`]** replays every change a [`Source`](crate::source::Source)
//!   announces onto another source, merging at field level where the two have diverged.
//! - **[`RequestConnector`]** lets a secondary [`Requestable`](crate::request::Requestable)
//!   assist or rescue the requests of a primary one.
//!
//! Both start active unless configured otherwise, can be deactivated and reactivated at will,
//! and disconnect when dropped.
pub mod request_connector;
pub mod transform_connector;

pub use request_connector::{RequestConnector, RequestConnectorOptions};
pub use transform_connector::{ConnectorOptions, TransformConnector};
