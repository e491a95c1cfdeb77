//! # moss-common: Shared Primitives
//!
//! Types shared across every crate in the workspace:
//!
//! * **[`MossConfig`]**: model hyper-parameters (read from `config.json`).
//! * **[`FfnActivation`]**: resolved MLP activation choice.
//! * **[`ModelName`]** / **[`GpuList`]** / **[`LaunchConfig`]**: validated
//!   command-line launch parameters.

pub mod config;
pub mod launch;

pub use config::{FfnActivation, MossConfig};
pub use launch::{GpuList, LaunchConfig, LaunchError, ModelName};
