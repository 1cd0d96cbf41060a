//! Callback references registered against hooks
//!
//! A callback is an opaque closure plus the metadata needed to attribute it to
//! source: where it was registered from, an optional qualified name, and for
//! plain functions the code address used for debug-info symbolication.

use std::fmt;
use std::panic::Location;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::host::HookRegistry;
use crate::value::HookValue;

/// Signature shared by every hook callback
///
/// The host passes itself in so a callback can dispatch nested hooks.
pub type CallbackFn = dyn Fn(&HookRegistry, &[HookValue]) -> anyhow::Result<HookValue>;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a registration, stable across wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub u64);

impl CallbackId {
    fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Source position a callback was registered from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallbackOrigin {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl From<&Location<'_>> for CallbackOrigin {
    fn from(location: &Location<'_>) -> Self {
        Self {
            file: location.file().to_string(),
            line: location.line(),
            column: location.column(),
        }
    }
}

/// Cache key identifying a callback for source resolution
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CallbackKey {
    Origin(CallbackOrigin),
    Name(String),
    Address(usize),
}

/// Descriptive metadata for a callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackMeta {
    /// Fully qualified name, if known
    pub name: Option<String>,
    /// Registration site
    pub origin: Option<CallbackOrigin>,
    /// Code address of a plain function
    pub addr: Option<usize>,
}

impl CallbackMeta {
    /// Metadata for an anonymous, dynamically generated callback
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Stable key for caching, or `None` when nothing identifies the callback
    ///
    /// A qualified name wins over the registration site: helpers marked
    /// `#[track_caller]` can register many named callbacks from one line.
    pub fn key(&self) -> Option<CallbackKey> {
        if let Some(name) = &self.name {
            return Some(CallbackKey::Name(name.clone()));
        }
        if let Some(origin) = &self.origin {
            return Some(CallbackKey::Origin(origin.clone()));
        }
        self.addr.map(CallbackKey::Address)
    }

    /// Human readable label for logs and tree rendering
    pub fn label(&self) -> String {
        match (&self.name, &self.origin) {
            (Some(name), _) => name.clone(),
            (None, Some(origin)) => format!("{{closure}}@{}:{}", origin.file, origin.line),
            (None, None) => match self.addr {
                Some(addr) => format!("fn@0x{:x}", addr),
                None => "{anonymous}".to_string(),
            },
        }
    }
}

/// A registered callback
#[derive(Clone)]
pub struct Callback {
    id: CallbackId,
    meta: Rc<CallbackMeta>,
    func: Rc<CallbackFn>,
    /// Registered body, kept while `func` is an instrumented replacement
    plain: Option<Rc<CallbackFn>>,
}

impl Callback {
    pub fn new(meta: CallbackMeta, func: Rc<CallbackFn>) -> Self {
        Self {
            id: CallbackId::next(),
            meta: Rc::new(meta),
            func,
            plain: None,
        }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn meta(&self) -> &Rc<CallbackMeta> {
        &self.meta
    }

    /// Whether this callback already reports to an observer
    pub fn is_instrumented(&self) -> bool {
        self.plain.is_some()
    }

    /// Same identity and metadata, running an instrumented `func`
    ///
    /// The registered body is remembered so [`Callback::uninstrumented`] can
    /// restore it.
    pub fn instrumented_with(&self, func: Rc<CallbackFn>) -> Self {
        let plain = self.plain.clone().unwrap_or_else(|| Rc::clone(&self.func));
        Self {
            id: self.id,
            meta: Rc::clone(&self.meta),
            func,
            plain: Some(plain),
        }
    }

    /// The callback as it was registered, without instrumentation
    pub fn uninstrumented(&self) -> Self {
        Self {
            id: self.id,
            meta: Rc::clone(&self.meta),
            func: self.plain.clone().unwrap_or_else(|| Rc::clone(&self.func)),
            plain: None,
        }
    }

    /// Run the callback
    pub fn invoke(&self, host: &HookRegistry, args: &[HookValue]) -> anyhow::Result<HookValue> {
        (self.func)(host, args)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("id", &self.id)
            .field("meta", &self.meta)
            .field("instrumented", &self.is_instrumented())
            .finish()
    }
}
