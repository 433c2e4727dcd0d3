//! Plays the stored pattern bank (or a demo groove) on the default device.
//!
//! usage: headless [seconds] [config.json]

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use stepsynth::engine::drums::NoSamples;
use stepsynth::engine::sequencer::PatternBank;
use stepsynth::fs_api::{load_config, JsonPatternStore, PatternStore};
use stepsynth::{Command, Engine, EngineConfig, EngineHost, Instrument};
use tracing_subscriber::filter::LevelFilter;

fn demo_bank() -> Result<PatternBank> {
  let mut bank = PatternBank::default();
  for step in [0, 4, 8, 12] { bank.toggle_step(0, Instrument::Drums, 0, step, 1.0)?; }
  for step in [4, 12] { bank.toggle_step(0, Instrument::Drums, 1, step, 0.9)?; }
  for step in (0..16).step_by(2) { bank.toggle_step(0, Instrument::Drums, 2, step, 0.6)?; }
  for (row, step) in [(0, 0), (0, 3), (4, 6), (3, 10), (2, 14)] { bank.toggle_step(0, Instrument::Bass, row, step, 0.9)?; }
  for (row, step) in [(7, 0), (5, 4), (4, 8), (2, 12)] { bank.toggle_step(0, Instrument::Keys, row, step, 0.7)?; }
  Ok(bank)
}

fn main() -> Result<()> {
  tracing_subscriber::fmt().with_max_level(LevelFilter::INFO).init();

  let mut args = std::env::args().skip(1);
  let secs: u64 = match args.next() {
    Some(s) => s.parse().with_context(|| format!("bad duration {s:?}"))?,
    None => 8,
  };
  let config = match args.next() {
    Some(p) => load_config(Path::new(&p))?,
    None => EngineConfig::default(),
  };

  let bank = match JsonPatternStore::in_documents().and_then(|s| s.load()) {
    Ok(b) if !b.patterns.is_empty() => b,
    Ok(_) => demo_bank()?,
    Err(e) => {
      log::warn!("{e:#}; using the demo pattern");
      demo_bank()?
    }
  };

  let host = EngineHost::spawn(move || {
    let mut engine = Engine::with_default_device(config, Box::new(NoSamples))?;
    engine.replace_patterns(bank);
    Ok(engine)
  })
  .context("engine start")?;

  host.send(Command::SetEffectEnabled { effect: "reverb".into(), enabled: true })?;
  host.send(Command::SetEffectEnabled { effect: "delay".into(), enabled: true })?;
  host.send(Command::SetEffectParam { effect: "delay".into(), param: "wetness".into(), value: 0.2 })?;
  host.send(Command::StartPlayback)?;
  std::thread::sleep(Duration::from_secs(secs));
  host.send(Command::StopPlayback)?;

  let stats = host.stats()?;
  println!("{}", serde_json::to_string_pretty(&stats)?);
  Ok(())
}
