//! MediaRun Server Library
//!
//! This crate provides the generation service core: admission, the task
//! executor with its per-queue worker pools, the memory-budgeted model pool,
//! and the HTTP surface in front of them.

pub mod admission;
pub mod auth;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod executor;
pub mod http;
pub mod metrics;
pub mod notify;
pub mod pool;
pub mod storage;
pub mod store;

pub use admission::{AdmissionController, AdmissionError, Submission};
pub use config::ServerConfig;
pub use engine::{Components, Engine, EngineError};
pub use executor::TaskExecutor;
pub use pool::{ModelLease, ModelPool, PoolError, PoolSnapshot};
