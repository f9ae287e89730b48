//! Config for crate-wide behaviors
//!
//! This module provides options that are not specific to one match or one tournament: console
//! output, log files and what happens to agent stderr.
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`].
//!
//! # Environment Variables
//!
//! All values are optional. Flags are case-insensitive, set them to `"true"` to enable them.
//!
//! - `ARENA_VERBOSE` — Print running tournament matches to stdout (default: `false`)
//! - `ARENA_LOG` — Enable logging to a file (default: `false`)
//! - `ARENA_LOG_DIR` — Directory of the log file (default: current directory)
//! - `ARENA_LOG_LEVEL` — `trace`, `debug`, `info`, `warn` or `error` (default: `debug`)
//! - `ARENA_DEBUG_AGENT_STDERR` — Forward agent stderr to the log (default: `false`)
//! - `ARENA_AGENT_LOG_DIR` — Write each agent's stderr to a file in this directory

use std::path::PathBuf;

use tracing::Level;

/// Configuration for crate-wide behaviors.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) log_dir: Option<PathBuf>,
    pub(crate) log_level: Level,
    pub(crate) debug_agent_stderr: bool,
    pub(crate) agent_log_dir: Option<PathBuf>,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - Nothing is printed to stdout.
    /// - Logging to file is disabled.
    /// - Agent stderr is discarded.
    pub fn new() -> Self {
        Self {
            verbose: false,
            log: false,
            log_dir: None,
            log_level: Level::DEBUG,
            debug_agent_stderr: false,
            agent_log_dir: None,
        }
    }

    /// Create configuration from environment variables.
    ///
    /// See the module documentation for the recognized variables. Any other value (including
    /// unset) results in the default value for each field.
    pub fn from_env() -> Self {
        fn get_env_flag(var: &str, default: bool) -> bool {
            match std::env::var(var) {
                Ok(val) => val.eq_ignore_ascii_case("true"),
                Err(_) => default,
            }
        }

        fn get_env_path(var: &str) -> Option<PathBuf> {
            std::env::var_os(var)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        }

        let log_level = std::env::var("ARENA_LOG_LEVEL")
            .ok()
            .and_then(|l| l.parse::<Level>().ok())
            .unwrap_or(Level::DEBUG);

        Self {
            verbose: get_env_flag("ARENA_VERBOSE", false),
            log: get_env_flag("ARENA_LOG", false),
            log_dir: get_env_path("ARENA_LOG_DIR"),
            log_level,
            debug_agent_stderr: get_env_flag("ARENA_DEBUG_AGENT_STDERR", false),
            agent_log_dir: get_env_path("ARENA_AGENT_LOG_DIR"),
        }
    }

    /// Enable or disable printing running matches to stdout.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    /// Directory the log file is created in.
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Most verbose level written to the log file.
    pub fn with_log_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    /// Enable or disable agent stderr forwarding to the log (debug purposes only).
    pub fn with_debug_agent_stderr(mut self, value: bool) -> Self {
        self.debug_agent_stderr = value;
        self
    }

    /// Write each agent's stderr to its own file in `dir`.
    pub fn with_agent_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agent_log_dir = Some(dir.into());
        self
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Configuration::new()
            .with_verbose(true)
            .with_log(true)
            .with_log_level(Level::INFO)
            .with_agent_log_dir("/tmp/agents");
        assert!(config.verbose);
        assert!(config.log);
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.debug_agent_stderr);
        assert_eq!(config.agent_log_dir, Some(PathBuf::from("/tmp/agents")));
    }
}
