//! File/component attribution for callbacks
//!
//! Resolution happens in two independent steps:
//!
//! 1. a [`SourceResolver`] turns a callback reference into the file that
//!    defines it (registration site, or debug info for plain functions)
//! 2. a [`RootTable`] (pure data: an ordered list of `(prefix, type)` pairs)
//!    maps that file to its owning component
//!
//! The first root whose prefix contains the file wins, so more specific roots
//! (plugin directories nested inside the core tree) must come first. The
//! component name is the first path segment beneath the matching root.
//!
//! Results are cached per callback key in a process-wide, read-mostly cache.
//! Concurrent fills of the same key keep whichever write lands first.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::callback::{CallbackKey, CallbackMeta};
use crate::error::ConfigError;

/// Logical owner of a source file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentType {
    MuPlugin,
    Plugin,
    Theme,
    Core,
}

impl ComponentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MuPlugin => "mu-plugin",
            Self::Plugin => "plugin",
            Self::Theme => "theme",
            Self::Core => "core",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mu-plugin" => Ok(Self::MuPlugin),
            "plugin" => Ok(Self::Plugin),
            "theme" => Ok(Self::Theme),
            "core" => Ok(Self::Core),
            other => Err(ConfigError::UnknownComponentType(other.to_string())),
        }
    }
}

/// Resolved owner of a callback
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SourceLocation {
    #[serde(rename = "type")]
    pub component_type: ComponentType,
    #[serde(rename = "name")]
    pub component_name: String,
    #[serde(rename = "file")]
    pub file_path: PathBuf,
}

impl SourceLocation {
    /// `type:name`, the aggregation key
    pub fn component_key(&self) -> String {
        format!("{}:{}", self.component_type, self.component_name)
    }
}

/// A directory owning every file beneath it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRoot {
    pub prefix: PathBuf,
    #[serde(rename = "type")]
    pub component_type: ComponentType,
}

impl ComponentRoot {
    pub fn new(prefix: impl Into<PathBuf>, component_type: ComponentType) -> Self {
        Self {
            prefix: prefix.into(),
            component_type,
        }
    }
}

impl FromStr for ComponentRoot {
    type Err = ConfigError;

    /// Parse `TYPE=PREFIX`, e.g. `plugin=/srv/wp-content/plugins`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, prefix) = s
            .split_once('=')
            .ok_or_else(|| ConfigError::InvalidRoot(s.to_string()))?;
        if prefix.is_empty() {
            return Err(ConfigError::InvalidRoot(s.to_string()));
        }
        Ok(Self::new(prefix, kind.trim().parse()?))
    }
}

/// Ordered prefix table mapping files to components
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RootTable {
    roots: Vec<ComponentRoot>,
}

impl RootTable {
    pub fn new(roots: Vec<ComponentRoot>) -> Self {
        Self { roots }
    }

    /// Conventional layout below an install root
    pub fn wordpress(abspath: impl AsRef<Path>) -> Self {
        let abspath = abspath.as_ref();
        let content = abspath.join("wp-content");
        Self::new(vec![
            ComponentRoot::new(content.join("mu-plugins"), ComponentType::MuPlugin),
            ComponentRoot::new(content.join("plugins"), ComponentType::Plugin),
            ComponentRoot::new(content.join("themes"), ComponentType::Theme),
            ComponentRoot::new(abspath, ComponentType::Core),
        ])
    }

    pub fn roots(&self) -> &[ComponentRoot] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Attribute a file to the first root containing it
    pub fn classify(&self, file: &Path) -> Option<SourceLocation> {
        self.roots.iter().find_map(|root| {
            let rest = file.strip_prefix(&root.prefix).ok()?;
            let name = match rest.components().next()? {
                Component::Normal(segment) => segment.to_string_lossy().into_owned(),
                _ => return None,
            };
            Some(SourceLocation {
                component_type: root.component_type,
                component_name: name,
                file_path: file.to_path_buf(),
            })
        })
    }
}

/// Finds the file that defines a callback
pub trait SourceResolver: Send + Sync {
    fn resolve_file(&self, callback: &CallbackMeta) -> Option<PathBuf>;
}

/// Uses the registration site captured at `add_*` time
#[derive(Debug, Clone, Copy, Default)]
pub struct OriginResolver;

impl SourceResolver for OriginResolver {
    fn resolve_file(&self, callback: &CallbackMeta) -> Option<PathBuf> {
        callback.origin.as_ref().map(|origin| PathBuf::from(&origin.file))
    }
}

/// Symbolicates a function's code address through debug info
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugInfoResolver;

impl SourceResolver for DebugInfoResolver {
    fn resolve_file(&self, callback: &CallbackMeta) -> Option<PathBuf> {
        let addr = callback.addr?;
        let mut file = None;
        backtrace::resolve(addr as *mut c_void, |symbol| {
            if file.is_none() {
                file = symbol.filename().map(Path::to_path_buf);
            }
        });
        file
    }
}

/// Tries resolvers in order
#[derive(Default)]
pub struct ChainResolver {
    resolvers: Vec<Box<dyn SourceResolver>>,
}

impl ChainResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, resolver: impl SourceResolver + 'static) -> Self {
        self.resolvers.push(Box::new(resolver));
        self
    }
}

impl SourceResolver for ChainResolver {
    fn resolve_file(&self, callback: &CallbackMeta) -> Option<PathBuf> {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.resolve_file(callback))
    }
}

/// Caching callback-to-component locator
pub struct FileLocator {
    resolver: Box<dyn SourceResolver>,
    roots: RootTable,
    cache: RwLock<HashMap<CallbackKey, Option<Arc<SourceLocation>>>>,
    resolutions: AtomicU64,
}

impl FileLocator {
    /// Locator using registration sites, then debug info
    pub fn new(roots: RootTable) -> Self {
        let resolver = ChainResolver::new()
            .with(OriginResolver)
            .with(DebugInfoResolver);
        Self::with_resolver(roots, resolver)
    }

    pub fn with_resolver(roots: RootTable, resolver: impl SourceResolver + 'static) -> Self {
        Self {
            resolver: Box::new(resolver),
            roots,
            cache: RwLock::new(HashMap::new()),
            resolutions: AtomicU64::new(0),
        }
    }

    pub fn roots(&self) -> &RootTable {
        &self.roots
    }

    /// Owning component of a callback; `None` means unattributed
    pub fn locate(&self, callback: &CallbackMeta) -> Option<Arc<SourceLocation>> {
        let Some(key) = callback.key() else {
            tracing::trace!("callback has no stable identity, leaving unattributed");
            return None;
        };

        if let Some(cached) = self.cache.read().get(&key) {
            return cached.clone();
        }

        self.resolutions.fetch_add(1, Ordering::Relaxed);
        let resolved = self
            .resolver
            .resolve_file(callback)
            .and_then(|file| self.roots.classify(&file))
            .map(Arc::new);
        if resolved.is_none() {
            tracing::debug!(callback = %callback.label(), "callback outside all component roots");
        }

        self.cache.write().entry(key).or_insert(resolved).clone()
    }

    /// Number of times the resolver actually ran
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.read().len()
    }
}

impl fmt::Debug for FileLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLocator")
            .field("roots", &self.roots)
            .field("cached_entries", &self.cached_entries())
            .finish()
    }
}
