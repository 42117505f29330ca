//! readflow-dispatch library crate.
//!
//! Delivers processed articles to user-configured outgoing providers.
//! Article events enter through the [`event_bus`], the
//! [`pipeline::DeliveryPipeline`] turns them into delivery attempts that
//! are rate limited, sent and retried under the [`scheduler`].

pub mod config;
pub mod domain;
pub mod error;
pub mod event_bus;
pub mod logging;
pub mod pipeline;
pub mod provider;
pub mod rate_limiter;
pub mod scheduler;
pub mod store;

pub use error::{Error, Result};
