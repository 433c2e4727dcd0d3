use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use serde::Serialize;

use super::config::EngineConfig;
use super::error::{EngineError, Result};
use super::messages::GraphLink;
use super::render::{AudioClock, Renderer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState { Running, Suspended, Closed }

/// Device lifecycle as the engine sees it.
pub trait AudioOutput {
  fn state(&self) -> DeviceState;
  fn resume(&mut self) -> Result<()>;
  fn suspend(&mut self) -> Result<()>;
  /// Audio clock in seconds.
  fn current_time(&self) -> f64;
  fn sample_rate(&self) -> f32;
  fn link(&self) -> GraphLink;
}

pub struct CpalOutput {
  stream: cpal::Stream,
  state: DeviceState,
  clock: AudioClock,
  link: GraphLink,
}

fn supports(range: &cpal::SupportedStreamConfigRange, sr: u32) -> bool {
  range.channels() == 2
    && range.sample_format() == cpal::SampleFormat::F32
    && range.min_sample_rate().0 <= sr
    && range.max_sample_rate().0 >= sr
}

// prefer 44100 (more compatible), then 48000, then the fastest stereo f32 rate
fn choose_config(device: &cpal::Device) -> Result<cpal::SupportedStreamConfig> {
  let ranges: Vec<cpal::SupportedStreamConfigRange> = device
    .supported_output_configs()
    .map(|it| it.collect())
    .unwrap_or_default();
  for sr in [44_100u32, 48_000] {
    if let Some(r) = ranges.iter().find(|r| supports(r, sr)) {
      return Ok(r.clone().with_sample_rate(cpal::SampleRate(sr)));
    }
  }
  if let Some(r) = ranges.iter().find(|r| r.channels() == 2 && r.sample_format() == cpal::SampleFormat::F32) {
    return Ok(r.clone().with_max_sample_rate());
  }
  device.default_output_config().map_err(|e| EngineError::DeviceUnavailable(e.to_string()))
}

impl CpalOutput {
  pub fn open(cfg: &EngineConfig) -> Result<Self> {
    let host = cpal::default_host();
    let device = host
      .default_output_device()
      .ok_or_else(|| EngineError::DeviceUnavailable("no output device".into()))?;
    let supported = choose_config(&device)?;
    let mut stream_cfg: cpal::StreamConfig = supported.into();
    // larger fixed buffer keeps underruns away
    stream_cfg.buffer_size = cpal::BufferSize::Fixed(cfg.buffer_frames);
    let sr = stream_cfg.sample_rate.0 as f32;
    let channels = stream_cfg.channels as usize;

    let (link, rx, bin) = GraphLink::duplex();
    let mut renderer = Renderer::new(sr, rx, cfg).with_bin(bin);
    let clock = renderer.clock();
    let err_fn = |e: cpal::StreamError| log::error!("stream error: {e}");
    let stream = device
      .build_output_stream(&stream_cfg, move |data: &mut [f32], _| renderer.render(data, channels), err_fn, None)
      .map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
    stream.play().map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
    log::info!("audio: {} Hz, {} ch, {} frame buffer", sr, channels, cfg.buffer_frames);
    Ok(Self { stream, state: DeviceState::Running, clock, link })
  }
}

impl AudioOutput for CpalOutput {
  fn state(&self) -> DeviceState { self.state }

  fn resume(&mut self) -> Result<()> {
    self.stream.play().map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
    self.state = DeviceState::Running;
    Ok(())
  }

  fn suspend(&mut self) -> Result<()> {
    self.stream.pause().map_err(|e| EngineError::DeviceUnavailable(e.to_string()))?;
    self.state = DeviceState::Suspended;
    Ok(())
  }

  fn current_time(&self) -> f64 { self.clock.now() }
  fn sample_rate(&self) -> f32 { self.clock.sample_rate() }
  fn link(&self) -> GraphLink { self.link.clone() }
}

/// Stand-in when no device could be opened: every command still works, nothing sounds.
pub struct NullOutput { sr: f32 }

impl NullOutput {
  pub fn new(sr: f32) -> Self { Self { sr } }
}

impl AudioOutput for NullOutput {
  fn state(&self) -> DeviceState { DeviceState::Closed }
  fn resume(&mut self) -> Result<()> { Err(EngineError::DeviceUnavailable("no output device".into())) }
  fn suspend(&mut self) -> Result<()> { Ok(()) }
  fn current_time(&self) -> f64 { 0.0 }
  fn sample_rate(&self) -> f32 { self.sr }
  fn link(&self) -> GraphLink { GraphLink::detached() }
}

/// Output whose renderer is pumped by hand; used for tests and offline bounces.
pub struct OfflineOutput {
  state: DeviceState,
  clock: AudioClock,
  link: GraphLink,
}

pub struct OfflineRender { renderer: Renderer }

impl OfflineRender {
  /// Renders `frames` stereo frames, interleaved.
  pub fn render(&mut self, frames: usize) -> Vec<f32> {
    let mut out = vec![0.0; frames * 2];
    self.renderer.render(&mut out, 2);
    out
  }

  pub fn live_sources(&self) -> usize { self.renderer.live_sources() }
}

pub fn offline(cfg: &EngineConfig) -> (OfflineOutput, OfflineRender) {
  let (link, rx, bin) = GraphLink::duplex();
  let renderer = Renderer::new(cfg.sample_rate, rx, cfg).with_bin(bin);
  let clock = renderer.clock();
  (OfflineOutput { state: DeviceState::Running, clock, link }, OfflineRender { renderer })
}

impl AudioOutput for OfflineOutput {
  fn state(&self) -> DeviceState { self.state }
  fn resume(&mut self) -> Result<()> { self.state = DeviceState::Running; Ok(()) }
  fn suspend(&mut self) -> Result<()> { self.state = DeviceState::Suspended; Ok(()) }
  fn current_time(&self) -> f64 { self.clock.now() }
  fn sample_rate(&self) -> f32 { self.clock.sample_rate() }
  fn link(&self) -> GraphLink { self.link.clone() }
}
