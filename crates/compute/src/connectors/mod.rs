//! Provider connectors.
//!
//! This module contains the [`Connector`] and [`ServingConnector`] traits
//! and one implementation per provider family:
//!
//! - [`polling`] - request/response APIs polled for status
//! - [`session`] - rented machines driven over SSH
//! - [`serverless`] - managed function invocation
//! - [`mock`] - scripted in-process provider

pub mod http;
pub mod mock;
pub mod polling;
pub mod registry;
pub mod serverless;
pub mod session;
pub mod traits;

pub use mock::MockConnector;
pub use registry::{ConnectorRegistry, ProviderHandle};
pub use traits::{Connector, ServingConnector};

use chrono::{DateTime, Utc};

/// Parse an optional RFC 3339 timestamp from a provider payload.
pub(crate) fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
