//! Match recorded cycling tracks against a reference cycle-node network.
//!
//! A run takes a batch of GPX files, buffers every track into a corridor and
//! reports which network segments (and the nodes at their ends) each track
//! actually rode. Progress is exposed through a [`ProgressHandle`] that a UI
//! or CLI polls while the run works on its own thread.

pub mod archive;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod io;
pub mod matcher;
pub mod model;
pub mod network;
pub mod nodes;
pub mod parsers;
pub mod progress;
pub mod projection;
pub mod strategy;

pub use config::{MatchConfig, OutputFormat};
pub use engine::{spawn_run, Engine, MatchOutput, RunSummary};
pub use error::{MatchError, Result};
pub use model::{EmptyReason, ReferenceNetwork, Stage};
pub use progress::{ProgressHandle, ProgressView};
