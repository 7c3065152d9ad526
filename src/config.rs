//! Daemon configuration stored as a single JSON document.
//!
//! The config file holds every forward definition keyed by name:
//!
//! ```json
//! { "forwards": { "postgres-local": { "type": "socket", ... } } }
//! ```
//!
//! Location is the platform-standard per-user app-data directory:
//! - Linux: `~/.kubeportal/config.json`
//! - macOS: `~/Library/Application Support/KubePortal/config.json`
//! - Windows: `%LOCALAPPDATA%/KubePortal/config.json`
//!
//! When the outer map key differs from the inner `name` field, the outer
//! key wins and the loader rewrites `name`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::forward::ForwardDefinition;
use crate::{Error, Result};

const APP_DIR_NAME: &str = "KubePortal";
const UNIX_DOT_DIR: &str = ".kubeportal";
const CONFIG_FILE_NAME: &str = "config.json";

/// On-disk schema: forward definitions keyed by name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// All persisted forward definitions, keyed by forward name.
    #[serde(default)]
    pub forwards: BTreeMap<String, ForwardDefinition>,
}

impl ConfigFile {
    /// Parse a config document from JSON, rewriting each definition's
    /// `name` to its outer map key.
    pub fn from_json(data: &str) -> Result<Self> {
        let mut config: ConfigFile = serde_json::from_str(data)
            .map_err(|e| Error::config_io(format!("failed to parse config: {}", e)))?;
        for (key, def) in config.forwards.iter_mut() {
            if def.name() != key {
                def.set_name(key);
            }
        }
        Ok(config)
    }

    /// Serialize to the pretty-printed on-disk form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::config_io(format!("failed to serialize config: {}", e)))
    }
}

/// Returns the platform-standard config file path, without creating it.
pub fn default_config_path() -> Result<PathBuf> {
    let dir = if cfg!(any(target_os = "macos", target_os = "windows")) {
        dirs::data_local_dir()
            .ok_or_else(|| Error::config_io("could not determine app-data directory"))?
            .join(APP_DIR_NAME)
    } else {
        dirs::home_dir()
            .ok_or_else(|| Error::config_io("could not determine home directory"))?
            .join(UNIX_DOT_DIR)
    };
    Ok(dir.join(CONFIG_FILE_NAME))
}

/// Handle to the persisted config document.
///
/// A store without a path (`ConfigStore::disabled`) turns persistence into
/// a no-op, which test code uses to run managers against throwaway state.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// Create a store backed by the given file path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Create a store that never touches disk.
    pub fn disabled() -> Self {
        Self { path: None }
    }

    /// The backing file path, if persistence is enabled.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Read the raw config document; `None` when persistence is disabled
    /// or the file does not exist yet.
    pub fn read_raw(&self) -> Result<Option<String>> {
        let Some(path) = &self.path else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        std::fs::read_to_string(path)
            .map(Some)
            .map_err(|e| Error::config_io(format!("failed to read {}: {}", path.display(), e)))
    }

    /// Load the config file, returning an empty document when the file is
    /// missing or persistence is disabled.
    pub fn load(&self) -> Result<ConfigFile> {
        match self.read_raw()? {
            Some(data) => ConfigFile::from_json(&data),
            None => Ok(ConfigFile::default()),
        }
    }

    /// Write the full document, creating parent directories on demand and
    /// flushing to disk before returning. Returns the serialized payload so
    /// callers can track their own writes.
    pub fn save(&self, config: &ConfigFile) -> Result<String> {
        let data = config.to_json()?;
        let Some(path) = &self.path else {
            return Ok(data);
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::config_io(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        let mut file = std::fs::File::create(path)
            .map_err(|e| Error::config_io(format!("failed to write {}: {}", path.display(), e)))?;
        file.write_all(data.as_bytes())
            .and_then(|_| file.sync_all())
            .map_err(|e| Error::config_io(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(data)
    }
}
