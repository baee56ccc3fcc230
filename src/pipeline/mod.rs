//! Pipeline lifecycle and the components that steer a running pipeline.
//!
//! - [`PipelineState`] carries the single halt flag and the run counters.
//! - [`ConcurrencyController`] resizes the worker pool from recent file sizes.
//! - [`RemoteSync`] moves published files to an rclone remote.
//! - [`PipelineSupervisor`] wires everything together for one run.

mod controller;
mod state;
mod supervisor;
mod sync;

pub use controller::{ConcurrencyController, ControllerSettings, SizeWindow, recommend_workers};
pub use state::{HaltReason, PipelineState, PipelineSummary, RunState};
pub use supervisor::{PipelineError, PipelineSupervisor};
pub use sync::{
    MAX_TRANSFERS, MIN_TRANSFERS, RemoteSync, TreeStats, calculate_transfers,
    recommended_transfers, scan_tree,
};
