//! Admission and routing core of the pinggate API gateway.
//!
//! Every request passes rate limiting, authentication and a per-service
//! circuit breaker before it is forwarded to the upstream named in its path.

pub mod admin;
pub mod auth;
pub mod breaker;
pub mod config;
pub mod core;
pub mod logging;
pub mod observability;
pub mod pipeline;
pub mod policy;
pub mod proxy;
pub mod ratelimit;
pub mod service;
pub(crate) mod utils;
