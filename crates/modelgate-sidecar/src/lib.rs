//! Sidecar lifecycle for modelgate.
//!
//! The AI-routing sidecar is a separately-distributed executable that this
//! server launches and owns. [`config_gen`] projects database state into
//! the sidecar's YAML configuration; [`supervisor`] spawns the child,
//! probes its health, restarts it on config changes, and recovers from
//! crashes.

pub mod config_gen;
pub mod error;
pub mod supervisor;

pub use error::SidecarError;
pub use supervisor::{ProxyStatus, Supervisor, SupervisorConfig};
