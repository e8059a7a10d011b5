//! # mountkeepd - connection-management core for SSHFS mounts
//!
//! `mountkeepd` is the library that backs a macOS menu-bar utility for
//! keeping SSHFS mounts alive. It owns connecting, disconnecting, refreshing,
//! and recovering mounts, a directory-browser session layer for remote
//! listings, and the diagnostics that back a support export. It does not own
//! persistence, Keychain access, UI, or OS signal bridging (sleep/wake,
//! network reachability, Finder unmount notifications) — those are supplied
//! by the embedding application through the traits in [`traits`].
//!
//! ## Layout
//!
//! - [`process`] - sandboxed external process execution with timeout and
//!   cancellation support
//! - [`path`] / [`mount_table`] / [`askpass`] / [`unmount`] - low-level
//!   collaborators used by the mount manager
//! - [`mount_manager`] - connect / disconnect / refresh / test / force-stop
//!   for a single remote
//! - [`browser`] - directory-browser sessions over a remote's filesystem
//! - [`operations`] - the per-remote operation admission engine
//! - [`recovery`] - the controller that decides when and how to reconnect
//! - [`password`] - password cache in front of the embedding app's secret
//!   store
//! - [`diagnostics`] - redacted event ring buffer and snapshot builder
//! - [`core`] - the façade wiring all of the above into one public API
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mountkeepd::core::{Core, CoreDeps};
//!
//! # async fn run(deps: CoreDeps) -> Result<(), mountkeepd::error::CoreError> {
//! let core = Core::new(deps);
//! core.load().await?;
//! core.run_startup_auto_connect().await;
//! let _timer = core.start_recovery_timer(std::time::Duration::from_secs(15));
//! # Ok(())
//! # }
//! ```

pub mod askpass;
pub mod browser;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod error;
pub mod model;
pub mod mount_manager;
pub mod mount_table;
pub mod operations;
pub mod password;
pub mod path;
pub mod process;
pub mod recovery;
pub mod traits;
pub mod unmount;
pub mod util;

#[cfg(test)]
mod testutil;
