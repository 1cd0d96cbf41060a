//! Invocation watcher: turns before/after events into an invocation tree
//!
//! Hook dispatch is synchronous, so before/after events nest strictly (LIFO).
//! The watcher mirrors the host's call depth with an explicit stack:
//!
//! ```text
//! before(X)  stack: [X]        X is a root
//! before(Y)  stack: [X, Y]     Y.parent = X
//! after(Y)   stack: [X]        Y finalised
//! after(X)   stack: []         X finalised
//! ```
//!
//! An after-event for anything other than the top of the stack means the
//! instrumentation lost track of the host. It is reported as an integrity
//! error and changes nothing, so later events are still processed normally.
//! Invocations whose after-event never arrives (aborted requests) stay open
//! and report their duration as unavailable.

use std::cell::{Ref, RefCell};
use std::fmt::Write as _;
use std::rc::Rc;
use std::sync::Arc;

use crate::callback::CallbackMeta;
use crate::clock::{Clock, MonotonicClock};
use crate::error::WatcherError;
use crate::host::{ActionLog, HookRegistry};
use crate::invocation::{HookCall, HookKind, Invocation, InvocationId, InvocationRecord};
use crate::locator::FileLocator;
use crate::value::{is_modified, HookValue};
use crate::wrapper::{CallOutcome, HookContext, InvocationObserver};

#[derive(Debug, Default)]
struct WatcherState {
    stack: Vec<InvocationId>,
    invocations: Vec<Invocation>,
    integrity_errors: u64,
}

impl WatcherState {
    // Ids are allocated in increasing order, so the arena stays sorted.
    fn index_of(&self, id: InvocationId) -> Option<usize> {
        self.invocations.binary_search_by_key(&id, |inv| inv.id).ok()
    }
}

/// Per-request invocation stack machine
pub struct InvocationWatcher {
    locator: Arc<FileLocator>,
    clock: Box<dyn Clock>,
    state: RefCell<WatcherState>,
}

impl InvocationWatcher {
    pub fn new(locator: Arc<FileLocator>) -> Self {
        Self::with_clock(locator, MonotonicClock::new())
    }

    pub fn with_clock(locator: Arc<FileLocator>, clock: impl Clock + 'static) -> Self {
        Self {
            locator,
            clock: Box::new(clock),
            state: RefCell::new(WatcherState::default()),
        }
    }

    pub fn locator(&self) -> &Arc<FileLocator> {
        &self.locator
    }

    /// Open a new invocation as a child of the current top of stack
    pub fn on_before(
        &self,
        hook: &str,
        priority: i32,
        input: &HookValue,
        callback: &Rc<CallbackMeta>,
    ) -> InvocationId {
        // Attribution happens outside the timed interval.
        let source = self.locator.locate(callback);

        let mut state = self.state.borrow_mut();
        let id = InvocationId::next();
        let parent = state.stack.last().copied();
        let depth = state.stack.len();

        if let Some(parent_idx) = parent.and_then(|p| state.index_of(p)) {
            state.invocations[parent_idx].children.push(id);
        }

        state.invocations.push(Invocation {
            id,
            parent,
            children: Vec::new(),
            depth,
            start: self.clock.now(),
            end: None,
            callback: Rc::clone(callback),
            source,
            hook: HookCall {
                name: hook.to_string(),
                priority,
                value_modified: None,
            },
            input: Some(input.clone()),
        });
        state.stack.push(id);

        tracing::trace!(%id, hook, priority, depth, "invocation opened");
        id
    }

    /// Close the invocation on top of the stack
    ///
    /// `output` is `None` when the callback failed or panicked; such filters
    /// record no modification verdict.
    pub fn on_after(
        &self,
        handle: InvocationId,
        output: Option<&HookValue>,
        kind: HookKind,
    ) -> Result<(), WatcherError> {
        let end = self.clock.now();
        let mut state = self.state.borrow_mut();

        let check = match state.stack.last() {
            None => Err(WatcherError::StackUnderflow { handle }),
            Some(&top) if top != handle => Err(WatcherError::OutOfOrder {
                expected: top,
                found: handle,
            }),
            Some(_) => Ok(()),
        };
        if let Err(err) = check {
            state.integrity_errors += 1;
            tracing::warn!("{}", err);
            return Err(err);
        }

        state.stack.pop();
        let idx = state
            .index_of(handle)
            .ok_or(WatcherError::UnknownInvocation(handle))?;
        let invocation = &mut state.invocations[idx];
        invocation.end = Some(end);
        let input = invocation.input.take();
        invocation.hook.value_modified = match (kind, input, output) {
            (HookKind::Filter, Some(input), Some(output)) => Some(is_modified(&input, output)),
            _ => None,
        };

        tracing::trace!(
            id = %handle,
            hook = %invocation.hook.name,
            %kind,
            value_modified = ?invocation.hook.value_modified,
            "invocation closed"
        );
        Ok(())
    }

    /// Innermost open invocation; what output or queries should be attributed to
    pub fn current(&self) -> Option<InvocationId> {
        self.state.borrow().stack.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.state.borrow().stack.len()
    }

    /// Open invocations, outermost first
    pub fn open_invocations(&self) -> Vec<InvocationId> {
        self.state.borrow().stack.clone()
    }

    /// All invocations in creation order
    pub fn invocations(&self) -> Ref<'_, [Invocation]> {
        Ref::map(self.state.borrow(), |state| state.invocations.as_slice())
    }

    pub fn get(&self, id: InvocationId) -> Option<Ref<'_, Invocation>> {
        Ref::filter_map(self.state.borrow(), |state| {
            state.index_of(id).map(|idx| &state.invocations[idx])
        })
        .ok()
    }

    pub fn len(&self) -> usize {
        self.state.borrow().invocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Integrity errors seen so far
    pub fn integrity_errors(&self) -> u64 {
        self.state.borrow().integrity_errors
    }

    /// Root invocations in creation order
    pub fn roots(&self) -> Vec<InvocationId> {
        self.state
            .borrow()
            .invocations
            .iter()
            .filter(|inv| inv.is_root())
            .map(|inv| inv.id)
            .collect()
    }

    pub fn export(&self, log: &dyn ActionLog) -> Vec<InvocationRecord> {
        self.invocations().iter().map(|inv| inv.export(log)).collect()
    }

    /// Indented text rendering of the invocation tree
    pub fn render_tree(&self, log: &dyn ActionLog) -> String {
        let state = self.state.borrow();
        let mut out = String::new();
        let mut pending: Vec<InvocationId> = state
            .invocations
            .iter()
            .rev()
            .filter(|inv| inv.is_root())
            .map(|inv| inv.id)
            .collect();

        while let Some(id) = pending.pop() {
            let Some(inv) = state.index_of(id).map(|idx| &state.invocations[idx]) else {
                continue;
            };
            let kind = inv.kind(log);
            let timing = match inv.duration() {
                Ok(d) => format!("{:.3}ms", d.as_secs_f64() * 1000.0),
                Err(_) => "incomplete".to_string(),
            };
            let _ = write!(
                out,
                "{:indent$}#{} {} {} (priority {}) {} {}",
                "",
                inv.id,
                kind,
                inv.hook.name,
                inv.hook.priority,
                timing,
                inv.callback.label(),
                indent = inv.depth * 2
            );
            if let Some(source) = inv.source_location() {
                let _ = write!(out, " [{}]", source.component_key());
            }
            if kind == HookKind::Filter && inv.hook.value_modified == Some(true) {
                out.push_str(" modified");
            }
            out.push('\n');
            pending.extend(inv.children.iter().rev().copied());
        }
        out
    }

    /// Finished invocation set, consuming the watcher
    pub fn into_invocations(self) -> Vec<Invocation> {
        self.state.into_inner().invocations
    }
}

impl std::fmt::Debug for InvocationWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("InvocationWatcher")
            .field("invocations", &state.invocations.len())
            .field("depth", &state.stack.len())
            .field("integrity_errors", &state.integrity_errors)
            .finish()
    }
}

impl InvocationObserver for InvocationWatcher {
    type Handle = InvocationId;

    fn before(&self, _host: &HookRegistry, cx: &HookContext<'_>) -> anyhow::Result<InvocationId> {
        Ok(self.on_before(cx.hook, cx.priority, cx.value, cx.callback))
    }

    fn after(
        &self,
        host: &HookRegistry,
        cx: &HookContext<'_>,
        handle: InvocationId,
        outcome: CallOutcome<'_>,
    ) -> anyhow::Result<()> {
        let kind = HookKind::derive(cx.hook, host);
        self.on_after(handle, outcome.value(), kind)?;
        Ok(())
    }
}
