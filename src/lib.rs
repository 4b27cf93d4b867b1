//! # multihost - multihost test orchestration
//!
//! `multihost` runs the same test logic against groups of remote hosts
//! arranged into named topologies. Tests declare which hosts they need, the
//! crate finds out whether the inventory provides them, builds per-test role
//! objects bound to those hosts, runs remote setup and teardown around every
//! test and collects diagnostic artifacts.
//!
//! ## Core Concepts
//!
//! - **Inventory**: YAML description of domains and their hosts
//! - **Topology**: per domain, how many hosts of each role are needed
//! - **Topology mark**: a named topology with a controller and fixture names
//! - **Host**: session-long object owning the connection to a machine
//! - **Role**: per-test object wrapping one host
//! - **Utility**: host bound helper that reverts its changes
//! - **Topology controller**: hooks run around topologies and tests
//! - **Session**: one run of registered tests against one inventory
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      Session (runner)                         │
//! │   expand ─► select ─► order ─► setup hosts ─► per topology    │
//! └──────────────────────────────────────────────────────────────┘
//!                  │                         │
//!                  ▼                         ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │ Inventory                │   │ MultihostFixture (per test)  │
//! │ config ─► domain ─► host │   │ roles, utilities, controller │
//! └──────────────────────────┘   └──────────────────────────────┘
//!                  │                         │
//!                  └────────────┬────────────┘
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Connection                             │
//! │                 (SSH, podman/docker, local)                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use multihost::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let options = MultihostOptions::from_args();
//!     let mut session = Session::from_options(options, &MultihostRegistry::generic())?;
//!
//!     let client = TopologyMark::new(
//!         "client",
//!         Topology::new([TopologyDomain::new("test", [("client", 1)])])?,
//!     )
//!     .with_fixture("client", "test.client[0]");
//!
//!     session.register(
//!         TestCase::new("test_hostname", |ctx| async move {
//!             let client = ctx.mh()?.fixture("client")?.role()?.clone();
//!             client.host().conn().run("hostname", RunOptions::new()).await?;
//!             Ok(())
//!         })
//!         .topology(client),
//!     )?;
//!
//!     let report = session.run().await;
//!     report.print_summary();
//!     std::process::exit(report.exit_code());
//! }
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.
    //!
    //! ```rust,ignore
    //! use multihost::prelude::*;
    //! ```

    // Connections
    pub use crate::connection::{Connection, LogLevel, ProcessResult, RunOptions, Shell};

    // Error handling
    pub use crate::error::{Error, Result};

    // Inventory
    pub use crate::inventory::{
        BackupHost, DomainLayout, GenericHost, HostBase, MultihostConfig, MultihostHost,
        MultihostRegistry,
    };

    // Topologies and marks
    pub use crate::marks::{KnownTopologies, KnownTopologyGroup, TopologyMark};
    pub use crate::topology::{Topology, TopologyDomain};

    // Roles, utilities and controllers
    pub use crate::controller::{BackupTopologyController, HookArgs, TopologyController};
    pub use crate::role::{GenericRole, MultihostRole, RoleBase, RoleContext};
    pub use crate::utility::{Utility, UtilityState};

    // Tests
    pub use crate::fixture::{MultihostFixture, Outcome, Require, Requirement};
    pub use crate::options::MultihostOptions;
    pub use crate::runner::{Session, SessionReport, TestCase, TestContext};

    pub use clap::Parser;
}

// ============================================================================
// Core Modules
// ============================================================================

/// Error types and result aliases.
pub mod error;

/// Session logging: the global `tracing` subscriber and the per-session
/// record buffer split into artifacts.
pub mod logging;

/// Topology data model and satisfaction.
pub mod topology;

/// Topology marks, named sets and groups of marks.
pub mod marks;

// ============================================================================
// Hosts
// ============================================================================

/// Remote command execution.
///
/// This module provides the [`Connection`](connection::Connection) trait and
/// its transports:
/// - **SSH** (via russh): remote hosts
/// - **Container**: `podman exec` / `docker exec`
/// - **Local**: the machine running the tests
pub mod connection;

/// Inventory: configuration, domains, hosts and the factory registry.
pub mod inventory;

/// Host bound utilities and their dependency-ordered lifecycle.
pub mod utility;

/// Per-test roles.
pub mod role;

/// Ready made utilities and the command line builder.
pub mod utils;

// ============================================================================
// Test orchestration
// ============================================================================

/// Topology controllers.
pub mod controller;

/// The per-test multihost fixture.
pub mod fixture;

/// Artifacts collection.
pub mod artifacts;

/// Session options.
pub mod options;

/// Test registration, selection and the session lifecycle.
///
/// # Example
///
/// ```rust,ignore
/// use multihost::runner::{Session, TestCase};
///
/// let mut session = Session::new(config, options);
/// session.register(TestCase::new("test_ping", |_| async { Ok(()) }).without_multihost())?;
/// let report = session.run().await;
/// assert!(report.success());
/// ```
pub mod runner;

// ============================================================================
// Version Information
// ============================================================================

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Returns version information including build details.
pub fn version_info() -> VersionInfo {
    VersionInfo {
        version: env!("CARGO_PKG_VERSION"),
        rust_version: option_env!("CARGO_PKG_RUST_VERSION").unwrap_or("unknown"),
        target: std::env::consts::ARCH,
        profile: if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        },
    }
}

/// Version information of the build.
#[derive(Debug, Clone)]
pub struct VersionInfo {
    /// Semantic version string
    pub version: &'static str,
    /// Minimum Rust version required
    pub rust_version: &'static str,
    /// Target architecture
    pub target: &'static str,
    /// Build profile (debug or release)
    pub profile: &'static str,
}

impl std::fmt::Display for VersionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "multihost {} ({}, {})", self.version, self.target, self.profile)
    }
}
