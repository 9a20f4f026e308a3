//! Request/response job API provider.
//!
//! Jobs are created with one POST and then polled. The API exposes a job
//! lookup by idempotency key, so a submission whose response was lost can be
//! recovered without creating a duplicate.
//!
//! ## Endpoints
//!
//! - `GET  /v1/account` - identity check used by `connect`
//! - `GET  /v1/instance-types` and `/v1/instance-types/{id}/pricing`
//! - `POST /v1/jobs`, `GET /v1/jobs?idempotency_key=`, `GET /v1/jobs/{id}`
//! - `POST /v1/jobs/{id}/cancel`
//! - `GET  /v1/jobs/{id}/logs?offset=` - line-indexed cursor
//! - `GET  /v1/jobs/{id}/artifact`
//! - `POST /v1/endpoints`, `GET|PATCH|DELETE /v1/endpoints/{id}`
//!
//! ## Example
//!
//! ```ignore
//! use compute::connectors::polling::PollingConnector;
//!
//! let connector = PollingConnector::new("lambda", "https://cloud.example.com/api")?;
//! connector.connect(&secrets).await?;
//! let remote_id = connector.submit_job(&config, &key).await?;
//! ```

mod client;
mod models;

pub use client::PollingConnector;
