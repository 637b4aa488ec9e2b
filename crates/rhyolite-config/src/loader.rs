//! Layered configuration loading.
//!
//! The loader materializes the built-in defaults as a TOML tree, folds
//! each configuration layer into it (later layers win per key, tables
//! merge recursively), applies `RHY_*` environment overrides on top, and
//! only then deserializes the merged tree into [`RhyoliteConfig`]. A
//! missing layer is fine; an unreadable or unparsable one is an error
//! that names the offending file.

use std::path::{Path, PathBuf};
use std::{env, fs, io};

use crate::{ConfigError, RhyoliteConfig, paths};

/// Builds a [`RhyoliteConfig`] from the node's configuration layers.
pub struct ConfigLoader {
    node_home: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Loader rooted at the current directory with the `RHY` prefix.
    pub fn new() -> Self {
        Self {
            node_home: PathBuf::from("."),
            env_prefix: "RHY".to_string(),
        }
    }

    /// Sets the node home the file layers are resolved against.
    pub fn with_node_home(mut self, node_home: impl AsRef<Path>) -> Self {
        self.node_home = node_home.as_ref().to_path_buf();
        self
    }

    /// Overrides the environment variable prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads and validates the configuration.
    pub fn load(self) -> Result<RhyoliteConfig, ConfigError> {
        let mut merged = toml::Value::try_from(RhyoliteConfig::default())?;

        let mut layers: Vec<PathBuf> = Vec::new();
        if let Some(user_file) = paths::user_config_file() {
            layers.push(user_file);
        }
        layers.push(paths::node_config_file(&self.node_home));
        layers.push(paths::local_config_file(&self.node_home));
        for path in layers {
            if let Some(layer) = read_layer(&path)? {
                merge_layer(&mut merged, layer);
            }
        }

        apply_env_overrides(&mut merged, &self.env_prefix, env::vars());

        let config: RhyoliteConfig = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration, falling back to defaults on any failure.
    pub fn load_or_default(self) -> RhyoliteConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads one layer. Absent files are skipped; anything else wrong with
/// the file is reported against its path.
fn read_layer(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source: err,
            });
        }
    };
    let layer = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(Some(layer))
}

/// Folds `overlay` into `base`: tables merge key by key, everything else
/// is replaced outright.
fn merge_layer(base: &mut toml::Value, overlay: toml::Value) {
    match (base, overlay) {
        (toml::Value::Table(base), toml::Value::Table(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_layer(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Applies `PREFIX_SECTION_FIELD` environment overrides to the merged
/// tree. Only sections the defaults already carry are touched; values
/// parse as bool, then integer, then fall back to a string.
fn apply_env_overrides<I>(merged: &mut toml::Value, prefix: &str, vars: I)
where
    I: Iterator<Item = (String, String)>,
{
    let toml::Value::Table(root) = merged else {
        return;
    };
    for (key, raw) in vars {
        let Some(rest) = key
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix('_'))
        else {
            continue;
        };
        let Some((section, field)) = rest.split_once('_') else {
            continue;
        };
        let section = section.to_ascii_lowercase();
        let field = field.to_ascii_lowercase();
        let Some(toml::Value::Table(section_table)) = root.get_mut(&section) else {
            // Not one of our sections; leave foreign variables alone.
            continue;
        };
        section_table.insert(field, parse_env_value(&raw));
    }
}

fn parse_env_value(raw: &str) -> toml::Value {
    if let Ok(flag) = raw.parse::<bool>() {
        return toml::Value::Boolean(flag);
    }
    if let Ok(number) = raw.parse::<i64>() {
        return toml::Value::Integer(number);
    }
    toml::Value::String(raw.to_string())
}
