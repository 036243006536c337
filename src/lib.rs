//! # KnotVM Core Library
//!
//! This crate contains the core logic of the `knot` tool – a cross-platform
//! Node.js version manager that installs runtimes under user-chosen aliases
//! and switches between them without touching system-wide state.
//!
//! Installations live in a per-user base directory (overridable via
//! `KNOTVM_DIR`); a JSON registry tracks them plus the single active one,
//! and prefixed proxy scripts forward `node`/`npm`/`npx` invocations to
//! whichever installation is active at call time.
//!
//! This library is built for the `knot` CLI, but you can also reuse it as a
//! backend in other tools.
//!
//! ## Modules Overview
//! - [`platform`] – Host OS/architecture detection and artifact naming
//! - [`paths`] – Base directory layout and environment overrides
//! - [`catalog`] – Fetching and caching the remote release index
//! - [`resolver`] – Version specs and artifact resolution
//! - [`download`] – Verified streaming downloads with retry
//! - [`extract`] – Staged archive extraction with atomic promotion
//! - [`cache`] – Verified archive cache with digest sidecars
//! - [`registry`] – Durable installation registry and active pointer
//! - [`lock`] – Cross-process lock files with stale reclaim
//! - [`pipeline`] – The install/activate/remove orchestration
//! - [`proxy`] – Proxy (shim) generation and proxied execution
//! - [`sync`] – Global package reconciliation against `globals.toml`
//! - [`project`] – Per-project version pins (`.nvmrc`, `engines.node`)
//! - [`cancel`] – Cooperative cancellation, wired to Ctrl-C
//! - [`error`] – Error codes, exit codes and remediation hints

pub mod cache;
pub mod cancel;
pub mod catalog;
pub mod download;
pub mod error;
pub mod extract;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod platform;
pub mod project;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod sync;

pub use error::{ErrorCode, KnotError, Result};
pub use paths::KnotPaths;
pub use registry::{Installation, Registry};
pub use resolver::VersionSpec;
