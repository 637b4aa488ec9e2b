//! Configuration errors.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration layer exists but could not be read.
    #[error("cannot read config layer {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    /// A configuration layer is not valid TOML.
    #[error("config layer {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// The built-in defaults failed to serialize into the merge tree.
    /// Indicates a bug in the config structs themselves.
    #[error("defaults did not serialize: {0}")]
    Encode(#[from] toml::ser::Error),

    /// The merged layers do not fit the configuration schema.
    #[error("merged configuration is malformed: {0}")]
    Schema(#[from] toml::de::Error),

    /// A field value breaks a cross-field constraint.
    #[error("invalid configuration: {0}")]
    Validation(String),
}
