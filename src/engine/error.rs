use thiserror::Error;

use super::scheduler::SchedulerError;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("audio device unavailable: {0}")]
  DeviceUnavailable(String),

  #[error("unknown effect `{0}`")]
  UnknownEffect(String),

  #[error("unknown parameter `{param}` for {effect}")]
  UnknownParam { effect: String, param: String },

  #[error("{name} = {value} is outside {min}..={max}")]
  OutOfRange { name: String, value: f32, min: f32, max: f32 },

  #[error("invalid parameter: {0}")]
  InvalidParameter(String),

  #[error("scheduling failed: {0}")]
  Scheduling(#[from] SchedulerError),

  #[error("invalid config: {0}")]
  InvalidConfig(String),

  #[error("render graph disconnected")]
  GraphDisconnected,
}

impl EngineError {
  pub fn invalid(msg: impl Into<String>) -> Self { Self::InvalidParameter(msg.into()) }

  /// Range check used by every numeric setter; non-finite values are rejected too.
  pub fn check_range(name: &str, value: f32, min: f32, max: f32) -> Result<f32> {
    if value.is_finite() && value >= min && value <= max {
      Ok(value)
    } else {
      Err(Self::OutOfRange { name: name.to_string(), value, min, max })
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn range_check_rejects_nan_and_bounds() {
    assert!(EngineError::check_range("x", 0.5, 0.0, 1.0).is_ok());
    assert!(EngineError::check_range("x", 1.0, 0.0, 1.0).is_ok());
    assert!(EngineError::check_range("x", 1.01, 0.0, 1.0).is_err());
    assert!(EngineError::check_range("x", f32::NAN, 0.0, 1.0).is_err());
  }

  #[test]
  fn messages_name_the_offender() {
    let e = EngineError::UnknownParam { effect: "delay".into(), param: "warp".into() };
    assert_eq!(e.to_string(), "unknown parameter `warp` for delay");
  }
}
