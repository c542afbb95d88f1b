use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use flap_record::StoreConfig;
use serde::{Deserialize, Serialize};

/// Contents of the `--config` TOML file.
///
/// ```toml
/// fixtures = "fixtures/sample.json"
///
/// [store]
/// namespace = "flapjack"
/// lock_timeout = 5000
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub store: StoreConfig,
    pub fixtures: Option<PathBuf>,
}

impl CliConfig {
    /// Read `path`, or return defaults when no file was given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    /// The fixture file to seed from; a command-line path wins.
    pub fn fixtures_path(&self, flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        flag.or_else(|| self.fixtures.clone())
            .context("no fixture file; pass --fixtures or set `fixtures` in the config")
    }
}
