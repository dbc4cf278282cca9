//! # Flexpool
//!
//! A dynamically resizable worker pool for Tokio applications.
//!
//! ## Features
//!
//! - **Lossless submission**: `add` waits when the intake queue is full instead of dropping jobs
//! - **Live rescaling**: grow or shrink workers and queue capacity while jobs keep flowing
//! - **Graceful or immediate stop**: drain everything first, or abandon what has not started
//! - **Reusable handles**: every stop leaves a fresh, startable generation behind
//! - **Convergence observer**: set a target worker count and let the pool follow it
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Dispatcher                            │
//! │  (worker set, queue pair, overflow list, lifecycle token)   │
//! └─────────────────────────────────────────────────────────────┘
//!         │ add()                                  ▲ rescale
//!         ▼                                        │
//! ┌───────────────┐   ┌─────────┐   ┌──────────────────────────┐
//! │ intake queue  │──▶│  Relay  │──▶│ overflow ──▶ output queue │
//! └───────────────┘   └─────────┘   └──────────────────────────┘
//!                                                  │
//!                                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                Workers [1] [2] [3] ... [N]                   │
//! │     (pull one job, run it to completion, repeat)            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! All operations that spawn tasks expect to run inside a Tokio runtime.
//!
//! ## Example
//!
//! ```ignore
//! use flexpool::prelude::*;
//!
//! let dispatcher = Dispatcher::new(3);
//! dispatcher.start()?;
//!
//! let done = dispatcher
//!     .add(|| async {
//!         fetch_and_store().await?;
//!         anyhow::Ok(())
//!     })
//!     .await;
//!
//! dispatcher.up_scale(8).await;
//! done.await?;
//!
//! // Drain every pending job, then stop
//! dispatcher.stop(false).await;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod global;
pub mod job;
mod pending;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::DispatcherConfig;
    pub use crate::dispatcher::{Dispatcher, DispatcherStats};
    pub use crate::error::{DispatchError, Result};
    pub use crate::job::{Completion, JobResult};
    pub use tokio_util::sync::CancellationToken;
}

// Re-export key types at crate root
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherStats};
pub use error::{DispatchError, Result};
pub use job::{Completion, JobResult};
pub use worker::WorkerState;
