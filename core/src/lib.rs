//! Blocking client for NGSIv2 context brokers behind a Keystone-style
//! identity service.
//!
//! # Overview
//! Collectors push KPI entities into the broker through a `ContextBroker`.
//! The broker authenticates once with `auth`, then every operation carries
//! the tenant routing headers and the current token, re-authenticating once
//! if the token has expired.
//!
//! # Design
//! - `Session` owns one connection pool and is confined to the thread that
//!   created it. Workers get their own from a `SessionFactory`.
//! - `AuthManager` keeps a versioned credential snapshot shared by all
//!   clones of a broker; refreshes are serialized.
//! - `ContextBroker::batch` splits the input into duplicate-free sub-batches
//!   because the broker rejects a batch that repeats an id.
//! - 404 on GET/DELETE is a value (`Fetched::Absent`, `Ok(None)`), never an
//!   error.
//!
//! ```no_run
//! use orion_core::{BrokerConfig, ContextBroker, Kpi, Session};
//!
//! # fn main() -> orion_core::Result<()> {
//! let config = BrokerConfig::from_env()?;
//! let session = Session::new();
//! let broker = ContextBroker::connect(&session, &config)?;
//! let kpis = vec![
//!     Kpi::new("followers_count", 1250).source("twitter").product("acme"),
//!     Kpi::new("followers_count", 1262).source("twitter").product("acme"),
//! ];
//! let requests = broker.batch(&session, kpis)?;
//! assert_eq!(requests, 2);
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod entity;
pub mod error;
pub mod http;
pub mod session;
pub mod throttle;

#[cfg(test)]
mod testing;

pub use auth::{AuthManager, Credentials};
pub use batch::{rotate, split_batches, EntityId};
pub use client::ContextBroker;
pub use config::{BrokerConfig, RateLimit};
pub use entity::{Attribute, Attributes, Entity, Kpi, KPI_ENTITY_TYPE};
pub use error::{FetchError, OrionError, Result};
pub use http::{HttpMethod, HttpRequest, HttpResponse};
pub use session::{Fetched, Session, SessionFactory, Transport, UreqTransport};
pub use throttle::Throttle;
