use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No configuration found; a default was written to {path}. Edit it and rerun.")]
    ConfigMissing { path: PathBuf },

    #[error("Failed to prepare variant {variant}: {message}")]
    Prepare { variant: String, message: String },

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Config problems abort the run before scheduling and are the only
    /// failures that end the process with a non-zero status.
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigMissing { .. })
    }

    pub fn prepare(variant: &str, message: impl std::fmt::Display) -> Self {
        Error::Prepare {
            variant: variant.to_string(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
