//! Labstats daemon configuration loading and validation.
//!
//! This crate provides:
//! - Typed settings parsed from `daemon.toml`
//! - Config file resolution (CLI → env → XDG → /etc → none)
//! - `LABSTATS_*` environment overrides
//! - Validation of the settings the run command cannot start without

pub mod resolve;
pub mod settings;
pub mod validate;

pub use resolve::{resolve_config_path, ConfigSource, ResolvedPath};
pub use settings::{load_settings, ConfigError, Settings, SignatureMethod};
pub use validate::{validate_for_run, DaemonSettings, ValidationError};

/// Default file name looked up in config directories.
pub const CONFIG_FILENAME: &str = "daemon.toml";
