//! tapegrid.toml configuration parser.
//!
//! Lookup order: an explicit path, then `$TAPEGRID_CFG_FILE`, then
//! `/etc/tapegrid.toml`. A missing default file is not an error. Scalar
//! keys can be overridden with `TAPEGRID_<SECTION>_<KEY>` variables, e.g.
//! `TAPEGRID_LRS_LOAD_RETRY_BUDGET=3`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{LayoutKind, ResourceFamily};

pub const CFG_FILE_ENV: &str = "TAPEGRID_CFG_FILE";
pub const DEFAULT_CFG_FILE: &str = "/etc/tapegrid.toml";
const ENV_PREFIX: &str = "TAPEGRID_";

/// Block size used when no per-family value is configured.
pub const DEFAULT_IO_BLOCK_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TapegridConfig {
    pub lrs: LrsConfig,
    pub io: IoConfig,
    pub store: StoreConfig,
    pub catalog: CatalogConfig,
    pub library: LibraryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrsConfig {
    /// Host name recorded in locks; defaults to the system host name.
    pub hostname: String,
    /// Maximum number of submitted requests not yet seen by the dispatcher.
    pub queue_depth: usize,
    pub busy_backoff_min_ms: u64,
    pub busy_backoff_max_ms: u64,
    /// A request still contending after this long fails with `Timeout`.
    pub busy_timeout_ms: u64,
    /// Extra load attempts after an `EINVAL` from the adapter.
    pub load_retry_budget: u32,
    pub catalog_retry_budget: u32,
    pub catalog_backoff_ms: u64,
    /// Flush the filesystem when a written medium is released.
    pub sync_on_release: bool,
}

impl Default for LrsConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            queue_depth: 1024,
            busy_backoff_min_ms: 10,
            busy_backoff_max_ms: 1000,
            busy_timeout_ms: 60_000,
            load_retry_budget: 1,
            catalog_retry_budget: 3,
            catalog_backoff_ms: 50,
            sync_on_release: true,
        }
    }
}

impl LrsConfig {
    pub fn busy_backoff_min(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_min_ms)
    }

    pub fn busy_backoff_max(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_max_ms.max(self.busy_backoff_min_ms))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn catalog_backoff(&self) -> Duration {
        Duration::from_millis(self.catalog_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Per-family I/O block size in bytes, keyed by family name; 0 or
    /// absent means the default.
    pub io_block_size: BTreeMap<String, usize>,
}

impl IoConfig {
    pub fn block_size(&self, family: ResourceFamily) -> usize {
        match self.io_block_size.get(family.as_str()) {
            Some(&size) if size > 0 => size,
            _ => DEFAULT_IO_BLOCK_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub default_layout: LayoutKind,
    pub default_family: ResourceFamily,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_layout: LayoutKind::Simple,
            default_family: ResourceFamily::Tape,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/tapegrid/catalog.redb"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    /// Root directory of the simulated library (drives, slots, media data).
    pub root: PathBuf,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/tapegrid/library"),
        }
    }
}

impl TapegridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: TapegridConfig = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// Resolve and load the configuration, then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match std::env::var_os(CFG_FILE_ENV) {
                Some(path) => Self::from_file(Path::new(&path))?,
                None if Path::new(DEFAULT_CFG_FILE).exists() => {
                    Self::from_file(Path::new(DEFAULT_CFG_FILE))?
                }
                None => {
                    debug!("no config file found, using defaults");
                    Self::default()
                }
            },
        };
        config.apply_overrides(std::env::vars())?;
        Ok(config)
    }

    /// Apply `TAPEGRID_<SECTION>_<KEY>=value` overrides to scalar keys.
    /// Unknown sections or keys are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut doc = toml::Value::try_from(&*self)?;
        let mut changed = false;
        for (name, raw) in vars {
            let Some(rest) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            if name == CFG_FILE_ENV {
                continue;
            }
            let rest = rest.to_ascii_lowercase();
            let Some((section, key)) = rest.split_once('_') else {
                continue;
            };
            let Some(entry) = doc
                .get_mut(section)
                .and_then(|s| s.as_table_mut())
                .and_then(|t| t.get_mut(key))
            else {
                continue;
            };
            *entry = match entry {
                toml::Value::Integer(_) => toml::Value::Integer(
                    raw.parse()
                        .with_context(|| format!("{name}: expected an integer"))?,
                ),
                toml::Value::Boolean(_) => toml::Value::Boolean(
                    raw.parse()
                        .with_context(|| format!("{name}: expected a boolean"))?,
                ),
                toml::Value::String(_) => toml::Value::String(raw),
                _ => continue,
            };
            debug!(var = %name, "config override applied");
            changed = true;
        }
        if changed {
            *self = doc.try_into()?;
        }
        Ok(())
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
