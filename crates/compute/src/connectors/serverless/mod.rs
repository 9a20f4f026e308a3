//! Managed serverless provider.
//!
//! Training runs as one invocation of a provider-hosted function; the
//! provider schedules and scales workers on its own. Serving endpoints are
//! autoscaled worker pools whose scaling can be changed in place.
//!
//! ## Endpoints
//!
//! - `POST /v2/{function}/run`, `GET /v2/{function}/status/{id}`
//! - `POST /v2/{function}/cancel/{id}`, `GET /v2/{function}/stream/{id}?offset=`
//! - `GET  /v2/{function}/requests?idempotency_key=`
//! - `GET  /v2/gpu-types`, `GET /v2/account`
//! - `POST /v2/endpoints`, `GET|PATCH|DELETE /v2/endpoints/{id}`

mod client;
mod models;

pub use client::ServerlessConnector;
