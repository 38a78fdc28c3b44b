//! Optional file-based configuration for TOML-backed plugin definitions.
//! The connection engine itself has no file-system dependency — loading and
//! persisting config is an embedder convenience gated behind the `config`
//! feature.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::builder::ConnectionBuilder;
use crate::codec::FramingVariant;
use crate::process::ChildProcessLauncher;

/// On-disk shape of a single plugin connection definition, read out of a
/// `[plugins.<name>]` table.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionFileConfig {
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub current_dir: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub framing: FramingVariantConfig,
    #[serde(default)]
    pub protocol_version: Option<u32>,
    #[serde(default)]
    pub min_protocol_version: Option<u32>,
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
    #[serde(default)]
    pub mirror_stderr: bool,
}

impl ConnectionFileConfig {
    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }

    /// Builds the `ConnectionBuilder` tuning knobs this entry specifies,
    /// leaving method handlers for the caller to register.
    pub fn connection_builder(&self) -> ConnectionBuilder {
        let mut builder = ConnectionBuilder::new().framing(self.framing.into());
        if let Some(version) = self.protocol_version {
            builder = builder.protocol_version(version);
        }
        if let Some(version) = self.min_protocol_version {
            builder = builder.min_protocol_version(version);
        }
        if let Some(timeout) = self.handshake_timeout() {
            builder = builder.handshake_timeout(timeout);
        }
        builder
    }

    /// Builds the launcher that spawns this entry's plugin process.
    pub fn child_process_launcher(&self) -> ChildProcessLauncher {
        let mut launcher =
            ChildProcessLauncher::new(self.binary.clone()).args(self.args.clone()).mirror_stderr(self.mirror_stderr);
        if let Some(dir) = &self.current_dir {
            launcher = launcher.current_dir(dir.clone());
        }
        for (key, value) in &self.env {
            launcher = launcher.env(key.clone(), value.clone());
        }
        launcher
    }
}

/// Wire framing as spelled in TOML. Converts to [`FramingVariant`].
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FramingVariantConfig {
    #[default]
    JsonStream,
    LineDelimited,
}

impl From<FramingVariantConfig> for FramingVariant {
    fn from(value: FramingVariantConfig) -> Self {
        match value {
            FramingVariantConfig::JsonStream => FramingVariant::JsonStream,
            FramingVariantConfig::LineDelimited => FramingVariant::LineDelimited,
        }
    }
}

/// Errors surfaced while loading plugin definitions from disk.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Default, Deserialize)]
struct PluginsFile {
    #[serde(default)]
    plugins: BTreeMap<String, ConnectionFileConfig>,
}

/// Loads every `[plugins.<name>]` table from a TOML file.
pub fn load_plugins(path: impl AsRef<Path>) -> Result<BTreeMap<String, ConnectionFileConfig>, ConfigError> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let file: PluginsFile =
        toml::from_str(&contents).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    Ok(file.plugins)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_a_plugin_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plugins.toml");
        std::fs::write(
            &path,
            r#"
            [plugins.formatter]
            binary = "/usr/local/bin/fmt-plugin"
            args = ["--stdio"]
            framing = "line_delimited"
            handshake_timeout_ms = 2000
            "#,
        )
        .unwrap();

        let plugins = load_plugins(&path).unwrap();
        let entry = plugins.get("formatter").expect("formatter entry present");
        assert_eq!(entry.binary, PathBuf::from("/usr/local/bin/fmt-plugin"));
        assert_eq!(entry.args, vec!["--stdio".to_string()]);
        assert_eq!(entry.framing, FramingVariantConfig::LineDelimited);
        assert_eq!(entry.handshake_timeout(), Some(Duration::from_millis(2000)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_plugins("/nonexistent/plugins.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
