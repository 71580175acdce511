//! KaaS control plane assembly
//!
//! Settings, the request-facing facade and the wiring that turns the
//! lifecycle, hierarchy and identity crates into one running process.

pub mod config;
pub mod control_plane;
pub mod startup;

pub use config::Settings;
pub use control_plane::{ControlPlane, TaskStatusView};
pub use startup::{assemble, Backends, Components};
