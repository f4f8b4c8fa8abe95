//! Command-line configuration module.
//!
//! This module provides configuration loading for the `pagetree` binary from
//! environment variables.
//!
//! # Environment Variables
//!
//! - `PAGETREE_PATH`: Database file (default: `./pagetree.db`)
//! - `PAGETREE_TREE_NAME`: Name written into a fresh tree's header (default: `bTree`)
//! - `PAGETREE_SYNC`: Whether to sync after every mutating command (default: `true`)
//!
//! # Invariants
//!
//! - `tree_name` is non-empty and fits in the header page

use std::path::PathBuf;

use crate::btree::{DEFAULT_TREE_NAME, MAX_NAME_LEN};

/// Configuration for the `pagetree` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliConfig {
    /// Database file holding the tree.
    pub path: PathBuf,
    /// Name given to the tree when the file is first created.
    /// Ignored when opening an existing file.
    pub tree_name: String,
    /// Sync the file after insert, update and delete.
    pub sync: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable is missing.
    MissingEnvVar(String),
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingEnvVar(name) => {
                write!(f, "missing required environment variable: {name}")
            }
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl CliConfig {
    /// Default database file.
    pub const DEFAULT_PATH: &'static str = "./pagetree.db";
    /// Default sync behavior.
    pub const DEFAULT_SYNC: bool = true;

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `PAGETREE_TREE_NAME` is set but empty or longer than 400 bytes
    /// - `PAGETREE_SYNC` is set but not a boolean
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            path: Self::load_path(),
            tree_name: Self::parse_tree_name(std::env::var("PAGETREE_TREE_NAME").ok())?,
            sync: Self::parse_sync(std::env::var("PAGETREE_SYNC").ok())?,
        })
    }

    /// Load the database path from environment.
    ///
    /// Returns the default if not set.
    fn load_path() -> PathBuf {
        std::env::var("PAGETREE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(Self::DEFAULT_PATH))
    }

    fn parse_tree_name(value: Option<String>) -> Result<String, ConfigError> {
        let Some(name) = value else {
            return Ok(DEFAULT_TREE_NAME.to_string());
        };

        if name.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "PAGETREE_TREE_NAME".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        if name.len() > MAX_NAME_LEN {
            return Err(ConfigError::InvalidValue {
                name: "PAGETREE_TREE_NAME".to_string(),
                message: format!("{} bytes is longer than {MAX_NAME_LEN}", name.len()),
            });
        }
        Ok(name)
    }

    fn parse_sync(value: Option<String>) -> Result<bool, ConfigError> {
        match value.as_deref() {
            None => Ok(Self::DEFAULT_SYNC),
            Some("true" | "1") => Ok(true),
            Some("false" | "0") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                name: "PAGETREE_SYNC".to_string(),
                message: format!("'{other}' is not a boolean (use true, false, 1 or 0)"),
            }),
        }
    }
}
