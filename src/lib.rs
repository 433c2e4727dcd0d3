pub mod engine {
  pub mod error;
  pub mod config;
  pub mod automation;
  pub mod scheduler;
  pub mod messages;
  pub mod graph;
  pub mod dsp;
  pub mod drums;
  pub mod rack;
  pub mod render;
  pub mod audio;
  pub mod pool;
  pub mod effects;
  pub mod voice;
  pub mod arpeggiator;
  pub mod sequencer;
  pub mod core;
  pub mod host;
}
pub mod commands;
pub mod fs_api;

pub use commands::{dispatch, Command};
pub use engine::config::EngineConfig;
pub use engine::core::{Engine, EngineStats};
pub use engine::error::{EngineError, Result};
pub use engine::host::EngineHost;
pub use engine::voice::Instrument;
