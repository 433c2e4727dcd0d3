use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Serialize};

use crate::engine::config::EngineConfig;
use crate::engine::sequencer::PatternBank;

/// Where pattern banks live between sessions.
pub trait PatternStore {
    /// A missing store loads as an empty bank.
    fn load(&self) -> Result<PatternBank>;
    fn save(&self, bank: &PatternBank) -> Result<()>;
}

pub struct JsonPatternStore {
    path: PathBuf,
}

impl JsonPatternStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<documents>/stepsynth/patterns.json`
    pub fn in_documents() -> Result<Self> {
        let base = dirs::document_dir().context("could not resolve documents dir")?;
        Ok(Self::new(base.join("stepsynth").join("patterns.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PatternStore for JsonPatternStore {
    fn load(&self) -> Result<PatternBank> {
        if !self.path.exists() {
            return Ok(PatternBank::default());
        }
        read_json(&self.path)
    }

    fn save(&self, bank: &PatternBank) -> Result<()> {
        write_json(&self.path, bank)
    }
}

/// Engine settings from a JSON file; absent keys keep their defaults.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let cfg: EngineConfig = read_json(path)?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let s = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&s).with_context(|| format!("parse {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("serialize")?;
    atomic_write(path, &data)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut tmp = PathBuf::from(path);
    tmp.set_extension("tmp");
    let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(data).context("write tmp")?;
    f.flush().context("flush tmp")?;
    drop(f);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644));
    }
    fs::rename(&tmp, path).with_context(|| format!("rename to {}", path.display()))?;
    log::debug!("wrote {}", path.display());
    Ok(())
}
