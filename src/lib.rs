//! `metadata-gateway` exposes selected GCE instance-metadata fields over HTTP.
//!
//! The crate is built around three pieces:
//! - [`MetadataClient`], a retrying fetcher for the metadata server
//! - the metadata request handler, mapping `/<prefix>/metadata/<type>` to JSON
//! - health checks that probe the metadata server and aggregate results
//!
//! [`gateway_router`] wires them into an axum [`Router`](axum::Router) with
//! security headers and access logging.

mod client;
mod context;
mod error;
mod key;
mod options;

pub mod config;
pub mod handler;
pub mod health;
pub mod observability;
pub mod router;
pub mod security;
pub mod server;

pub use client::{MetadataClient, MetadataFetcher, METADATA_FLAVOR};
pub use config::{ConfigError, GatewayConfig};
pub use context::{ContextError, RequestContext};
pub use error::MetadataError;
pub use health::{HealthCheck, HealthResponse, HealthStatus};
pub use key::{
    MetadataKey, UnknownMetadataKey, CLUSTER_LOCATION_URL, CLUSTER_NAME_URL, INSTANCE_ZONE_URL,
};
pub use observability::LogConfig;
pub use options::{ClientOptions, RetryPolicy};
pub use router::{gateway_router, AppState};
pub use security::SecurityHeaders;

pub type Result<T> = std::result::Result<T, MetadataError>;
