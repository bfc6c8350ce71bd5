//! # Homeshare Server Library
//!
//! This crate provides the storage backend of Homeshare: a multi-user file
//! server where every identity owns a sandboxed subtree and can publish
//! parts of it to other identities or to anonymous visitors.
//!
//! ## Overview
//!
//! - **Registry**: In-memory identity registry with address lookup and
//!   periodic, atomic persistence
//! - **Shares**: Materializes share grants as links inside each viewer's
//!   sandbox and answers access questions
//! - **Files**: Root-confined filesystem operations for sandboxes and share
//!   views
//! - **Previews**: Bounded worker pool driving an external converter script
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                        Homeshare                          │
//! ├───────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   │
//! │  │   Registry   │◄──│    Share     │   │   Preview    │   │
//! │  │    Store     │   │    Engine    │   │   Pipeline   │   │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘   │
//! │         │                  │                  │           │
//! │  ┌──────▼───────┐   ┌──────▼──────────────────▼───────┐   │
//! │  │ registry.json│   │  Sandboxes under storage root   │   │
//! │  └──────────────┘   └─────────────────────────────────┘   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, Homeshare};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(server::config::default_config_path())?;
//!
//!     let mut service = Homeshare::new(config)?;
//!     service.start().await?;
//!
//!     // Hand `service` to a protocol front-end...
//!
//!     service.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`registry`]: Identity registry and persistence
//! - [`shares`]: Share propagation and access resolution
//! - [`files`]: Sandboxed filesystem operations
//! - [`preview`]: Preview conversion pipeline
//! - [`orchestrator`]: Service coordinator
//! - [`error`]: Error classification

pub mod config;
pub mod error;
pub mod files;
pub mod orchestrator;
pub mod preview;
pub mod registry;
pub mod shares;

// Re-export model for convenience
pub use model;

pub use config::Config;
pub use error::ErrorKind;

pub use files::{FileSystem, OpenMode, Sandbox, SandboxError, ShareView, Visitor};

pub use registry::{RegistryError, RegistryStore};

pub use shares::{ShareEngine, ShareError, SharedEntry};

pub use preview::{MediaKind, PipelineOptions, PreviewError, PreviewPipeline, SubmitOutcome};

pub use orchestrator::{Homeshare, ServiceState};
