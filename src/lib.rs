//! # webtask-migrate
//!
//! Bounded-concurrency tooling for moving webtasks between deployments.
//!
//! A [`WorkQueue`](engine::WorkQueue) pumps deferred tasks through K lanes;
//! the [`Dispatcher`](engine::Dispatcher) runs every remote call through one
//! with exponential backoff; self-feeding producers enumerate webtasks page
//! by page and provision node modules batch by batch on top of it.

pub mod analysis;
pub mod config;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod producer;
pub mod remote;
pub mod telemetry;
pub mod token;
