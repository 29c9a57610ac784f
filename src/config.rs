//! Loading of the JSON configuration file.
//!
//! ```json
//! {
//!   "store_dir": "./metadata",
//!   "backup_dir": "./metadata/backup",
//!   "default_tasks": { "perform_download": true, "apply_watermark": true },
//!   "capabilities": {
//!     "perform_download": { "program": "yt-dlp-wrapper", "args": ["{input}"] },
//!     "apply_watermark": {
//!       "program": "python",
//!       "args": ["bin/call_watermark.py", "{input}"],
//!       "params": { "font_size": 24 }
//!     }
//!   }
//! }
//! ```
use std::collections::BTreeMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;

use crate::capability::{Capabilities, CommandCapability, CommandSpec};
use crate::error::{ConfigError, RegistryError};
use crate::task::{Registry, TaskKind};

/// Config file used when none is given explicitly.
pub const DEFAULT_CONFIG: &str = "conf/mimesis.json";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory of the ledger store.
    pub store_dir: Utf8PathBuf,
    /// Where ledgers are copied after each completed task.
    pub backup_dir: Option<Utf8PathBuf>,
    /// Default flags of the task registry.
    pub default_tasks: Option<BTreeMap<String, bool>>,
    /// Separate `{ "default_tasks": {..} }` file, takes precedence over
    /// `default_tasks`.
    pub tasks_file: Option<Utf8PathBuf>,
    /// External programs performing each task.
    pub capabilities: BTreeMap<String, CommandSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: Utf8PathBuf::from("./metadata"),
            backup_dir: None,
            default_tasks: None,
            tasks_file: None,
            capabilities: BTreeMap::new(),
        }
    }
}

#[derive(Deserialize)]
struct TasksFile {
    #[serde(default)]
    default_tasks: BTreeMap<String, bool>,
}

fn read_json<T>(path: &Utf8Path) -> Result<T, ConfigError>
where
    T: for<'de> Deserialize<'de>,
{
    let text = fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_owned(), e))?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse(path.to_owned(), e))
}

impl Config {
    pub fn load(path: &Utf8Path) -> Result<Self, ConfigError> {
        let config = read_json(path)?;
        tracing::debug!(path = %path, "loaded config");
        Ok(config)
    }

    /// Loads `path` if given. Otherwise loads [`DEFAULT_CONFIG`] when it
    /// exists, and falls back to defaults when it doesn't.
    pub fn load_or_default(path: Option<&Utf8Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None if Utf8Path::new(DEFAULT_CONFIG).is_file() => {
                Self::load(Utf8Path::new(DEFAULT_CONFIG))
            }
            None => {
                tracing::debug!("no config file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn registry(&self) -> Result<Registry, ConfigError> {
        if let Some(path) = &self.tasks_file {
            let file: TasksFile = read_json(path)?;
            return Ok(Registry::from_defaults(&file.default_tasks)?);
        }

        match &self.default_tasks {
            Some(defaults) => Ok(Registry::from_defaults(defaults)?),
            None => Ok(Registry::default()),
        }
    }

    pub fn capabilities(&self) -> Result<Capabilities, RegistryError> {
        let mut capabilities = Capabilities::new();

        for (name, spec) in &self.capabilities {
            let kind = name.parse::<TaskKind>()?;
            capabilities.insert(kind, CommandCapability::new(spec.clone()));
        }

        Ok(capabilities)
    }
}
