//! Per-request tracing sessions
//!
//! A session is only started when debug mode is on and the request carries the
//! opt-in parameter. Starting one wraps every callback already registered on
//! the host and every one registered later; finishing it aggregates the
//! invocation set and emits the `Server-Timing` headers.

use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use crate::config::Config;
use crate::host::HookRegistry;
use crate::locator::FileLocator;
use crate::server_timing::{self, ComponentTimings, HeaderSink};
use crate::watcher::InvocationWatcher;
use crate::wrapper::HookWrapper;

/// Decides whether a request is traced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugGate {
    debug: bool,
    opt_in_param: String,
}

impl DebugGate {
    pub fn new(debug: bool, opt_in_param: &str) -> Self {
        Self {
            debug,
            opt_in_param: opt_in_param.to_string(),
        }
    }

    /// Debug mode is on and `opt_in_param` is among the request parameters
    pub fn should_run(&self, params: &HashMap<String, String>) -> bool {
        self.debug && params.contains_key(&self.opt_in_param)
    }

    /// Same as [`should_run`](Self::should_run) for a raw query string such as `a=1&hooktrace`
    pub fn should_run_query(&self, query: &str) -> bool {
        self.debug
            && query
                .trim_start_matches('?')
                .split('&')
                .map(|pair| pair.split_once('=').map_or(pair, |(key, _)| key))
                .any(|key| key == self.opt_in_param)
    }
}

/// One traced request
pub struct Session {
    watcher: Rc<InvocationWatcher>,
    wrapper: Rc<HookWrapper<InvocationWatcher>>,
    wrapped: usize,
}

impl Session {
    /// Start tracing `registry` if the gate lets `query` through
    ///
    /// `locator` is shared by every session in the process so attribution
    /// results survive across requests.
    pub fn start(
        config: &Config,
        locator: &Arc<FileLocator>,
        registry: &HookRegistry,
        query: &str,
    ) -> Option<Self> {
        if !config.gate().should_run_query(query) {
            tracing::trace!("hook tracing not requested");
            return None;
        }
        Some(Self::attach(
            InvocationWatcher::new(Arc::clone(locator)),
            registry,
        ))
    }

    /// Start tracing unconditionally with a prepared watcher
    pub fn attach(watcher: InvocationWatcher, registry: &HookRegistry) -> Self {
        let watcher = Rc::new(watcher);
        let wrapper = Rc::new(HookWrapper::new(Rc::clone(&watcher)));
        let wrapped = wrapper.install(registry);
        tracing::info!(wrapped, "hook tracing session started");
        Self {
            watcher,
            wrapper,
            wrapped,
        }
    }

    pub fn watcher(&self) -> &InvocationWatcher {
        &self.watcher
    }

    /// Callbacks that were already registered when the session started
    pub fn wrapped_at_start(&self) -> usize {
        self.wrapped
    }

    pub fn timings(&self) -> ComponentTimings {
        server_timing::aggregate(&self.watcher.invocations())
    }

    /// Restore the registry's callbacks and send the timing headers
    ///
    /// After this the registry runs exactly as it did before the session
    /// started. Returns the number of headers sent.
    pub fn finish(self, registry: &HookRegistry, sink: &mut dyn HeaderSink) -> usize {
        let restored = self.wrapper.uninstall(registry);
        tracing::info!(restored, "hook tracing session finished");
        let open = self.watcher.depth();
        if open > 0 {
            tracing::debug!(open, "session finished with invocations still open");
        }
        server_timing::send(&self.watcher.invocations(), sink)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("watcher", &self.watcher)
            .field("wrapped", &self.wrapped)
            .finish()
    }
}
