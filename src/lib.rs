//! # comfy-driver
//!
//! Driver for submitting image-generation workflows to a ComfyUI-style
//! backend and shepherding each submission through asynchronous, multi-node
//! execution to completion.
//!
//! ## Core Components
//!
//! - [`graph::GraphConverter`]: flattens the author-facing node-and-link
//!   graph into the API-prompt form the backend accepts, resolving reroutes,
//!   variable indirection and primitive substitution against a fetched node
//!   schema.
//! - [`session::Session`]: per-submission runtime that correlates prompt ids
//!   across the HTTP response and the WebSocket event stream, tracks
//!   per-node timing, and routes preview bytes and rendered artifacts to
//!   storage.
//! - [`supervisor::Supervisor`]: queue-and-health gate deciding when the
//!   backend is ready for work, with a reboot recovery path.
//! - [`cache::FileManager`]: per-directory LRU-by-mtime staging cache with a
//!   byte budget, per-filename singleflight and retrying streamed copies.
//! - [`driver::Driver`]: glues the above behind a single submission entry
//!   point.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use comfy_driver::config::DriverConfig;
//! use comfy_driver::driver::{Driver, Request};
//! use comfy_driver::storage::DiskStorage;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> comfy_driver::Result<()> {
//! let config = DriverConfig {
//!     base_dir: "/srv/comfy".into(),
//!     ..Default::default()
//! };
//! let storage = Arc::new(DiskStorage::new("/srv/artifacts"));
//! let token = CancellationToken::new();
//!
//! let driver = Driver::new(config, storage, &token).await?;
//! let request: Request = serde_json::from_str(r#"{
//!     "workflow": {},
//!     "outputs": [{"node_ids": ["9"], "dir_path": "renders"}],
//!     "enable_node_replace": true
//! }"#)?;
//! let response = driver
//!     .handle_prompt_retry_on_oom(&token, &request, "task-1", "", None)
//!     .await?;
//! println!("saved {} outputs", response.outputs.len());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod config;
pub mod driver;
pub mod error;
pub mod graph;
pub mod node;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod supervisor;

// Flat re-exports for the common entry points.
pub use client::{Client, QueuePromptResp};
pub use config::{ClientConfig, DriverConfig};
pub use driver::{Driver, Request, Response};
pub use error::{BackendError, Error, Result};
pub use session::{ProgressInfo, Session};
pub use supervisor::Supervisor;
