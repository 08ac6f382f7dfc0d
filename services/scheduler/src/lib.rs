//! sked scheduler commit path.
//!
//! This crate ships a `scheduler` binary, but exposes its library surface
//! for integration testing and reuse by other scheduling loops.
//!
//! A placement decision travels through:
//!
//! - [`binder::Binder`], which commits it in sync or async mode.
//! - [`api_cache::CacheView`], the read view and call front door for plugins.
//! - [`cache::Cache`], which holds the optimistic assumption until the call
//!   reports.
//! - [`dispatcher::Dispatcher`], which orders, coalesces and executes calls
//!   per object key.
//! - [`api_calls`], the call kinds and the relevance table that decides how
//!   they coalesce.

pub mod api_cache;
pub mod api_calls;
pub mod binder;
pub mod cache;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod framework;
pub mod model;
pub mod scheduler;
