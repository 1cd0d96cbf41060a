//! Tracing configuration
//!
//! Loaded from a TOML file, then overridden by the environment and the
//! command line:
//!
//! ```toml
//! debug = true
//! opt_in_param = "hooktrace"
//!
//! # most specific roots first
//! [[roots]]
//! prefix = "/srv/www/wp-content/plugins"
//! type = "plugin"
//!
//! [[roots]]
//! prefix = "/srv/www"
//! type = "core"
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::locator::{ComponentRoot, RootTable};
use crate::session::DebugGate;

/// Query parameter that opts a request into tracing
pub const DEFAULT_OPT_IN_PARAM: &str = "hooktrace";

/// Environment variable that turns debug mode on
pub const DEBUG_ENV_VAR: &str = "HOOKTRACE_DEBUG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Tracing may run at all
    pub debug: bool,
    /// Request parameter whose presence activates a session
    pub opt_in_param: String,
    /// Component roots, first match wins
    pub roots: Vec<ComponentRoot>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            opt_in_param: DEFAULT_OPT_IN_PARAM.to_string(),
            roots: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Default settings with the conventional layout below `abspath`
    pub fn wordpress(abspath: impl AsRef<Path>) -> Self {
        Self {
            roots: RootTable::wordpress(abspath).roots().to_vec(),
            ..Self::default()
        }
    }

    /// Apply `HOOKTRACE_DEBUG` from the process environment
    pub fn apply_env(self) -> Self {
        let value = std::env::var(DEBUG_ENV_VAR).ok();
        self.apply_debug_var(value.as_deref())
    }

    /// Apply a `HOOKTRACE_DEBUG` value; only affirmative values turn debug on
    pub fn apply_debug_var(mut self, value: Option<&str>) -> Self {
        if let Some(value) = value {
            match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.debug = true,
                "0" | "false" | "no" | "off" | "" => self.debug = false,
                other => tracing::warn!("ignoring unrecognised {}={}", DEBUG_ENV_VAR, other),
            }
        }
        self
    }

    pub fn root_table(&self) -> RootTable {
        RootTable::new(self.roots.clone())
    }

    pub fn gate(&self) -> DebugGate {
        DebugGate::new(self.debug, &self.opt_in_param)
    }
}
