//! Unified error types for Harbormaster

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for Harbormaster operations
#[derive(Error, Debug)]
pub enum Error {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // Config errors
    #[error("Failed to read config file '{path}': {source}")]
    ConfigRead { path: PathBuf, source: io::Error },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config validation failed: {0}")]
    ConfigValidation(String),

    // Dependency errors
    #[error("Unknown dependency '{0}' - component not defined")]
    UnknownDependency(String),

    // Component errors
    #[error("Component '{0}' not found")]
    ComponentNotFound(String),

    #[error("Component '{0}' is already registered")]
    ComponentAlreadyRegistered(String),

    #[error("Component '{component}' cannot handle '{event}' while {state}")]
    InvalidTransition {
        component: String,
        state: String,
        event: String,
    },

    #[error("Failed to launch component '{component}': {message}")]
    LaunchFailed { component: String, message: String },

    #[error("Failed to stop component '{component}': {message}")]
    StopFailed { component: String, message: String },

    #[error("Component '{0}' is not running")]
    NotRunning(String),

    #[error("Command '{command}' failed: {message}")]
    CommandFailed { command: String, message: String },

    // Launch config errors
    #[error("Launch config for '{component}' is unusable: {message}")]
    LaunchConfigInvalid { component: String, message: String },

    // Control channel errors
    #[error("Control channel error: {0}")]
    Control(String),

    #[error("Daemon is not running (no control socket at {0})")]
    DaemonNotRunning(PathBuf),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for Harbormaster operations
pub type Result<T> = std::result::Result<T, Error>;
