use serde::{Deserialize, Serialize};

use super::error::{EngineError, Result};

/// Engine-wide tunables. Everything here is read once at construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Rate used by offline and null outputs; cpal picks its own.
  pub sample_rate: f32,
  /// Fixed cpal buffer size in frames.
  pub buffer_frames: u32,
  pub pool_capacity: usize,
  pub gain_prepopulate: usize,
  pub filter_prepopulate: usize,
  /// Upper bound of graph messages applied per audio callback.
  pub max_messages_per_block: usize,
  pub stuck_sweep_interval_ms: f64,
  pub stuck_voice_ceiling_ms: f64,
  /// Time constant for parameter and bus ramps, in seconds.
  pub ramp_tau: f64,
  pub tempo_bpm: f32,
  pub master_gain: f32,
  pub reverb: ReverbConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverbConfig {
  pub length_secs: f32,
  pub pre_delay_secs: f32,
  pub seed: u64,
}

impl Default for ReverbConfig {
  fn default() -> Self {
    Self { length_secs: 3.5, pre_delay_secs: 0.03, seed: 0x5EED_u64 }
  }
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      sample_rate: 44_100.0,
      buffer_frames: 1024,
      pool_capacity: 50,
      gain_prepopulate: 50,
      filter_prepopulate: 25,
      max_messages_per_block: 256,
      stuck_sweep_interval_ms: 20_000.0,
      stuck_voice_ceiling_ms: 20_000.0,
      ramp_tau: 0.01,
      tempo_bpm: 120.0,
      master_gain: 0.8,
      reverb: ReverbConfig::default(),
    }
  }
}

impl EngineConfig {
  pub fn validate(&self) -> Result<()> {
    if !(8_000.0..=192_000.0).contains(&self.sample_rate) {
      return Err(EngineError::InvalidConfig(format!("sample_rate {} out of range", self.sample_rate)));
    }
    if self.buffer_frames == 0 {
      return Err(EngineError::InvalidConfig("buffer_frames must be > 0".into()));
    }
    if self.pool_capacity == 0 {
      return Err(EngineError::InvalidConfig("pool_capacity must be > 0".into()));
    }
    if self.gain_prepopulate > self.pool_capacity || self.filter_prepopulate > self.pool_capacity {
      return Err(EngineError::InvalidConfig("prepopulation exceeds pool_capacity".into()));
    }
    if self.max_messages_per_block == 0 {
      return Err(EngineError::InvalidConfig("max_messages_per_block must be > 0".into()));
    }
    if self.stuck_sweep_interval_ms <= 0.0 || self.stuck_voice_ceiling_ms <= 0.0 {
      return Err(EngineError::InvalidConfig("stuck voice thresholds must be > 0".into()));
    }
    if !(self.ramp_tau > 0.0 && self.ramp_tau <= 0.1) {
      return Err(EngineError::InvalidConfig("ramp_tau must be in (0, 0.1]".into()));
    }
    if !(40.0..=300.0).contains(&self.tempo_bpm) {
      return Err(EngineError::InvalidConfig(format!("tempo_bpm {} out of range", self.tempo_bpm)));
    }
    if !(0.0..=2.0).contains(&self.master_gain) {
      return Err(EngineError::InvalidConfig("master_gain must be in 0..=2".into()));
    }
    if !(0.5..=10.0).contains(&self.reverb.length_secs) || !(0.0..=0.5).contains(&self.reverb.pre_delay_secs) {
      return Err(EngineError::InvalidConfig("reverb impulse shape out of range".into()));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults_are_valid() {
    let c = EngineConfig::default();
    assert!(c.validate().is_ok());
    assert_eq!(c.pool_capacity, 50);
    assert_eq!(c.filter_prepopulate, 25);
  }

  #[test]
  fn rejects_prepopulation_past_capacity() {
    let c = EngineConfig { pool_capacity: 10, ..Default::default() };
    assert!(matches!(c.validate(), Err(EngineError::InvalidConfig(_))));
  }

  #[test]
  fn partial_json_fills_defaults() {
    let c: EngineConfig = serde_json::from_str(r#"{ "tempo_bpm": 96.0, "reverb": { "seed": 7 } }"#).unwrap();
    assert_eq!(c.tempo_bpm, 96.0);
    assert_eq!(c.reverb.seed, 7);
    assert_eq!(c.reverb.length_secs, 3.5);
    assert_eq!(c.buffer_frames, 1024);
  }
}
