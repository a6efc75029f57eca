//! Provisioning engine for compute modules behind a cluster board BMC.
//!
//! For each slot (1..4) the engine drives three phases against hardware
//! reached only through the BMC:
//!
//! - **Image customization** - decompress a stock image, map and mount its
//!   root partition, write network settings and staged files, recompress
//!   ([`imageops`], [`builder`])
//! - **OS installation** - stage the image on the BMC, flash it, watch the
//!   UART for boot and run the first-boot password change ([`installer`])
//! - **Post-installation** - run a user action against the new system
//!   ([`postinstall`])
//!
//! # Architecture
//!
//! ```text
//! engine (phase state machine)
//!     │
//!     ├── builder ── imageops ── Toolbox: host tools | utility container
//!     │      └────── cache (local dir | BMC over SFTP)
//!     ├── installer ── ssh::Bmc ── ssh (russh)
//!     ├── postinstall ── ssh
//!     └── state (tftpi_state.json)
//! ```
//!
//! Every public operation takes an [`ExecContext`] carrying a deadline and
//! a cancellation token.

pub mod builder;
pub mod cache;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod imageops;
pub mod installer;
pub mod logging;
pub mod postinstall;
pub mod preflight;
pub mod process;
pub mod retry;
pub mod ssh;
pub mod state;

pub use context::ExecContext;
pub use engine::{PhaseOutcome, Provisioner};
pub use error::Error;
