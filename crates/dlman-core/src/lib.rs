//! DLMan Core - Download Engine
//!
//! This crate provides the core download functionality for DLMan:
//! multi-segment HTTP transfers, crash-safe persistence, a hierarchical
//! rate limiter, and the queue scheduler that ties them together behind
//! the single [`DlmanCore`] handle.

mod download_task;
mod error;
mod events;
mod manager;
mod persistence;
mod rate_limiter;
mod scheduler;
mod segment_worker;
mod transport;
mod writer;

pub use error::DlmanError;
pub use events::{EventBus, EventSubscription};
pub use manager::DlmanCore;
pub use transport::ProbeResult;
