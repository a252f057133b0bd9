//! # Session Orchestrator Daemon Library
//!
//! This crate runs browser sessions, one worker per session, behind a small
//! HTTP API.
//!
//! ## Overview
//!
//! A client asks for a session; the orchestrator reserves a port, starts a
//! worker bound to it, waits until the worker reports healthy and only then
//! hands back the session. Every step is recorded in a SQLite state store
//! before it is relied upon, so a restart resumes or cleans up whatever was
//! in flight. Sessions expire after a TTL and are reclaimed by a background
//! reaper.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         Orchestrator                          │
//! ├───────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────────┐   ┌──────────────┐   │
//! │  │   HTTP API   │──▶│ Durable Engine   │◀──│  TTL Reaper  │   │
//! │  └──────┬───────┘   └──┬─────┬──────┬──┘   └──────────────┘   │
//! │         │              │     │      │                         │
//! │  ┌──────▼───────┐ ┌────▼───┐ │ ┌────▼──────────────┐          │
//! │  │Request Router│ │  Port  │ │ │ Worker Supervisor │          │
//! │  └──────┬───────┘ │Allocatr│ │ │ (process/embedded)│          │
//! │         │         └────┬───┘ │ └───────────────────┘          │
//! │  ┌──────▼──────────────▼─────▼─────────────────────────────┐  │
//! │  │                State Store (SQLite)                     │  │
//! │  └─────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Orchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let mut orchestrator = Orchestrator::new(config);
//!     orchestrator.start().await?;
//!
//!     // Serve until a shutdown signal arrives...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading, defaults and validation
//! - [`logging`]: Tracing subscriber setup
//! - [`store`]: Durable sessions, workers, port reservations and operations
//! - [`ports`]: Port allocation
//! - [`supervisor`]: Worker launch capability and readiness policy
//! - [`engine`]: Durable create and teardown operations
//! - [`reaper`]: TTL expiry
//! - [`router`]: Session-to-worker routing and proxying
//! - [`http`]: HTTP API
//! - [`client`]: HTTP client for the API
//! - [`pidfile`]: Single-instance guard
//! - [`orchestrator`]: Wiring and lifecycle

pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod http;
pub mod logging;
pub mod orchestrator;
pub mod pidfile;
pub mod ports;
pub mod reaper;
pub mod router;
pub mod store;
pub mod supervisor;

// Re-export protocol for convenience
pub use protocol;

pub use client::{ClientError, OrchestratorClient};
pub use config::{Config, WorkerMode};
pub use engine::{Engine, RecoveryReport};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{Orchestrator, OrchestratorState};
pub use router::RequestRouter;
pub use store::{Session, Store, TerminationReason, Worker, WorkerState};
pub use supervisor::{
    EmbeddedLauncher, Launcher, ProcessLauncher, WorkerHandle, WorkerLauncher, WorkerSupervisor,
};
