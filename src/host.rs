//! Host hook registry
//!
//! A named, priority-ordered callback-chain mechanism: callbacks are registered
//! against a hook name at an integer priority, and dispatch runs them in
//! ascending priority (registration order breaks ties). Actions run callbacks
//! for their side effects; filters thread a value through the chain.
//!
//! The registry is the host the tracer instruments. Instrumentation reaches it
//! only through two seams:
//!
//! - [`ActionLog`]: "how many times has this action fired", used to classify
//!   an invocation as action or filter
//! - [`RegistrationInterceptor`]: consulted on every registration so the
//!   wrapper can substitute an instrumented callback
//!
//! Dispatch walks the live table rather than a snapshot, so callbacks that
//! register or remove other callbacks (or themselves) mid-dispatch behave as
//! they would without instrumentation.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::panic::Location;
use std::rc::Rc;

use crate::callback::{Callback, CallbackFn, CallbackId, CallbackMeta, CallbackOrigin};
use crate::value::HookValue;

/// Default priority for registrations
pub const DEFAULT_PRIORITY: i32 = 10;

/// Query for fired actions
pub trait ActionLog {
    /// Number of times the action `hook` has been dispatched
    fn did_action(&self, hook: &str) -> u64;
}

impl ActionLog for HashMap<String, u64> {
    fn did_action(&self, hook: &str) -> u64 {
        self.get(hook).copied().unwrap_or(0)
    }
}

/// Substitutes callbacks at registration time
pub trait RegistrationInterceptor {
    fn intercept(&self, hook: &str, priority: i32, callback: Callback) -> Callback;
}

type Table = BTreeMap<(i32, CallbackId), Callback>;

/// In-memory hook registry
#[derive(Default)]
pub struct HookRegistry {
    hooks: RefCell<HashMap<String, Table>>,
    actions: RefCell<HashMap<String, u64>>,
    interceptor: RefCell<Option<Rc<dyn RegistrationInterceptor>>>,
    dispatching: RefCell<Vec<String>>,
    registrations: Cell<u64>,
}

/// Pops the dispatching stack on every exit path, unwinding included
struct DispatchFrame<'a> {
    stack: &'a RefCell<Vec<String>>,
}

impl Drop for DispatchFrame<'_> {
    fn drop(&mut self) {
        self.stack.borrow_mut().pop();
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a filter callback, recording the caller as its origin
    #[track_caller]
    pub fn add_filter<F>(&self, hook: &str, priority: i32, f: F) -> CallbackId
    where
        F: Fn(&HookRegistry, &[HookValue]) -> anyhow::Result<HookValue> + 'static,
    {
        let meta = CallbackMeta {
            origin: Some(CallbackOrigin::from(Location::caller())),
            ..Default::default()
        };
        self.register(hook, priority, Callback::new(meta, Rc::new(f)))
    }

    /// Register an action callback, recording the caller as its origin
    #[track_caller]
    pub fn add_action<F>(&self, hook: &str, priority: i32, f: F) -> CallbackId
    where
        F: Fn(&HookRegistry, &[HookValue]) -> anyhow::Result<()> + 'static,
    {
        let meta = CallbackMeta {
            origin: Some(CallbackOrigin::from(Location::caller())),
            ..Default::default()
        };
        let body: Rc<CallbackFn> = Rc::new(move |host: &HookRegistry, args: &[HookValue]| {
            f(host, args).map(|()| HookValue::Null)
        });
        self.register(hook, priority, Callback::new(meta, body))
    }

    /// Register a callback under a fully qualified name
    #[track_caller]
    pub fn add_named<F>(&self, hook: &str, priority: i32, name: &str, f: F) -> CallbackId
    where
        F: Fn(&HookRegistry, &[HookValue]) -> anyhow::Result<HookValue> + 'static,
    {
        let meta = CallbackMeta {
            name: Some(name.to_string()),
            origin: Some(CallbackOrigin::from(Location::caller())),
            addr: None,
        };
        self.register(hook, priority, Callback::new(meta, Rc::new(f)))
    }

    /// Register a plain function, identified by its code address
    pub fn add_fn(
        &self,
        hook: &str,
        priority: i32,
        f: fn(&HookRegistry, &[HookValue]) -> anyhow::Result<HookValue>,
    ) -> CallbackId {
        let meta = CallbackMeta {
            addr: Some(f as usize),
            ..Default::default()
        };
        self.register(hook, priority, Callback::new(meta, Rc::new(f)))
    }

    /// Register a callback with no identifying metadata
    pub fn add_dynamic<F>(&self, hook: &str, priority: i32, f: F) -> CallbackId
    where
        F: Fn(&HookRegistry, &[HookValue]) -> anyhow::Result<HookValue> + 'static,
    {
        self.register(hook, priority, Callback::new(CallbackMeta::anonymous(), Rc::new(f)))
    }

    /// Register a prepared callback, passing it through the interceptor
    pub fn register(&self, hook: &str, priority: i32, callback: Callback) -> CallbackId {
        let interceptor = self.interceptor.borrow().clone();
        let callback = match interceptor {
            Some(interceptor) => interceptor.intercept(hook, priority, callback),
            None => callback,
        };
        let id = callback.id();
        self.hooks
            .borrow_mut()
            .entry(hook.to_string())
            .or_default()
            .insert((priority, id), callback);
        self.registrations.set(self.registrations.get() + 1);
        id
    }

    /// Unregister a callback; returns whether it was registered
    pub fn remove(&self, hook: &str, id: CallbackId) -> bool {
        let mut hooks = self.hooks.borrow_mut();
        let Some(table) = hooks.get_mut(hook) else {
            return false;
        };
        let key = table.keys().find(|(_, cid)| *cid == id).copied();
        match key {
            Some(key) => {
                table.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Unregister every callback on a hook
    pub fn remove_all(&self, hook: &str) {
        self.hooks.borrow_mut().remove(hook);
    }

    pub fn has_hook(&self, hook: &str) -> bool {
        self.hooks
            .borrow()
            .get(hook)
            .is_some_and(|table| !table.is_empty())
    }

    /// Registered callbacks for a hook in dispatch order
    pub fn callbacks(&self, hook: &str) -> Vec<(i32, Callback)> {
        self.hooks
            .borrow()
            .get(hook)
            .map(|table| {
                table
                    .iter()
                    .map(|((priority, _), cb)| (*priority, cb.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Names of all hooks with registrations
    pub fn hook_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hooks.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total registrations performed over the registry's lifetime
    pub fn registration_count(&self) -> u64 {
        self.registrations.get()
    }

    /// Install an interceptor for subsequent registrations
    pub fn set_interceptor(&self, interceptor: Rc<dyn RegistrationInterceptor>) {
        *self.interceptor.borrow_mut() = Some(interceptor);
    }

    pub fn clear_interceptor(&self) {
        *self.interceptor.borrow_mut() = None;
    }

    /// Pass every already-registered, uninstrumented callback through `interceptor`
    ///
    /// Returns the number of callbacks replaced.
    pub fn rewrap_all(&self, interceptor: &dyn RegistrationInterceptor) -> usize {
        let mut hooks = self.hooks.borrow_mut();
        let mut replaced = 0;
        for (hook, table) in hooks.iter_mut() {
            for ((priority, _), callback) in table.iter_mut() {
                if callback.is_instrumented() {
                    continue;
                }
                *callback = interceptor.intercept(hook, *priority, callback.clone());
                replaced += 1;
            }
        }
        replaced
    }

    /// Put every instrumented callback back to its registered body
    ///
    /// Returns the number of callbacks restored.
    pub fn unwrap_all(&self) -> usize {
        let mut hooks = self.hooks.borrow_mut();
        let mut restored = 0;
        for table in hooks.values_mut() {
            for callback in table.values_mut() {
                if callback.is_instrumented() {
                    *callback = callback.uninstrumented();
                    restored += 1;
                }
            }
        }
        restored
    }

    /// Run every callback on an action hook
    pub fn do_action(&self, hook: &str, args: &[HookValue]) -> anyhow::Result<()> {
        *self.actions.borrow_mut().entry(hook.to_string()).or_insert(0) += 1;
        self.dispatch(hook, |callback| callback.invoke(self, args).map(|_| ()))
    }

    /// Thread `value` through every callback on a filter hook
    pub fn apply_filters(
        &self,
        hook: &str,
        value: HookValue,
        extra: &[HookValue],
    ) -> anyhow::Result<HookValue> {
        let mut args = Vec::with_capacity(extra.len() + 1);
        args.push(value);
        args.extend_from_slice(extra);
        self.dispatch(hook, |callback| {
            args[0] = callback.invoke(self, &args)?;
            Ok(())
        })?;
        Ok(args.swap_remove(0))
    }

    /// Innermost hook currently being dispatched
    pub fn current_hook(&self) -> Option<String> {
        self.dispatching.borrow().last().cloned()
    }

    /// Whether `hook` is anywhere on the dispatch stack
    pub fn doing_hook(&self, hook: &str) -> bool {
        self.dispatching.borrow().iter().any(|h| h == hook)
    }

    fn dispatch<F>(&self, hook: &str, mut step: F) -> anyhow::Result<()>
    where
        F: FnMut(&Callback) -> anyhow::Result<()>,
    {
        self.dispatching.borrow_mut().push(hook.to_string());
        let _frame = DispatchFrame {
            stack: &self.dispatching,
        };

        let mut cursor = None;
        while let Some((key, callback)) = self.next_callback(hook, cursor) {
            cursor = Some(key);
            step(&callback)?;
        }
        Ok(())
    }

    // The table borrow is released before the callback runs.
    fn next_callback(
        &self,
        hook: &str,
        after: Option<(i32, CallbackId)>,
    ) -> Option<((i32, CallbackId), Callback)> {
        let hooks = self.hooks.borrow();
        let table = hooks.get(hook)?;
        let mut range = match after {
            None => table.range(..),
            Some(key) => table.range((Bound::Excluded(key), Bound::Unbounded)),
        };
        range.next().map(|(key, callback)| (*key, callback.clone()))
    }
}

impl ActionLog for HookRegistry {
    fn did_action(&self, hook: &str) -> u64 {
        self.actions.borrow().did_action(hook)
    }
}
