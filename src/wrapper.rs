//! Hook wrapper: transparent instrumentation of registered callbacks
//!
//! Every callback is replaced by one that reports a before-event, runs the
//! original, reports an after-event and hands back the original result
//! untouched. The host sees identical arguments, return values and errors.
//!
//! Observer failures are contained here. They are logged and dropped so that
//! instrumentation can never change what the application returns.

use std::rc::Rc;

use crate::callback::{Callback, CallbackFn, CallbackMeta};
use crate::host::{HookRegistry, RegistrationInterceptor};
use crate::value::{filtered_value, HookValue};

/// What a before/after observer learns about one call
#[derive(Debug, Clone, Copy)]
pub struct HookContext<'a> {
    pub hook: &'a str,
    pub priority: i32,
    pub callback: &'a Rc<CallbackMeta>,
    /// First argument: the filtered value, `null` when there is none
    pub value: &'a HookValue,
}

/// How the original callback finished
#[derive(Debug, Clone, Copy)]
pub enum CallOutcome<'a> {
    Returned(&'a HookValue),
    Failed(&'a anyhow::Error),
    /// Unwinding; reported from a drop guard
    Panicked,
}

impl<'a> CallOutcome<'a> {
    /// Returned value, if the callback returned normally
    pub fn value(&self) -> Option<&'a HookValue> {
        match self {
            Self::Returned(value) => Some(value),
            Self::Failed(_) | Self::Panicked => None,
        }
    }
}

/// Receives before/after events for wrapped callbacks
pub trait InvocationObserver {
    /// Correlates an after-event with its before-event
    type Handle;

    fn before(&self, host: &HookRegistry, cx: &HookContext<'_>) -> anyhow::Result<Self::Handle>;

    fn after(
        &self,
        host: &HookRegistry,
        cx: &HookContext<'_>,
        handle: Self::Handle,
        outcome: CallOutcome<'_>,
    ) -> anyhow::Result<()>;
}

/// Observer built from a pair of closures
pub struct ClosureObserver<B, A> {
    before: B,
    after: A,
}

/// Build an observer from `before` and `after` closures
pub fn observe_with<H, B, A>(before: B, after: A) -> ClosureObserver<B, A>
where
    B: Fn(&HookContext<'_>) -> anyhow::Result<H>,
    A: Fn(&HookContext<'_>, H, CallOutcome<'_>) -> anyhow::Result<()>,
{
    ClosureObserver { before, after }
}

impl<H, B, A> InvocationObserver for ClosureObserver<B, A>
where
    B: Fn(&HookContext<'_>) -> anyhow::Result<H>,
    A: Fn(&HookContext<'_>, H, CallOutcome<'_>) -> anyhow::Result<()>,
{
    type Handle = H;

    fn before(&self, _host: &HookRegistry, cx: &HookContext<'_>) -> anyhow::Result<H> {
        (self.before)(cx)
    }

    fn after(
        &self,
        _host: &HookRegistry,
        cx: &HookContext<'_>,
        handle: H,
        outcome: CallOutcome<'_>,
    ) -> anyhow::Result<()> {
        (self.after)(cx, handle, outcome)
    }
}

/// Reports the after-event exactly once, even while unwinding
struct AfterGuard<'a, O: InvocationObserver> {
    observer: &'a O,
    host: &'a HookRegistry,
    cx: &'a HookContext<'a>,
    handle: Option<O::Handle>,
}

impl<O: InvocationObserver> AfterGuard<'_, O> {
    fn finish(&mut self, outcome: CallOutcome<'_>) {
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.observer.after(self.host, self.cx, handle, outcome) {
                tracing::warn!(hook = self.cx.hook, "after-event observer failed: {:#}", err);
            }
        }
    }
}

impl<O: InvocationObserver> Drop for AfterGuard<'_, O> {
    fn drop(&mut self) {
        self.finish(CallOutcome::Panicked);
    }
}

/// Wrap one callback so `observer` sees its before and after events
///
/// Already instrumented callbacks are returned as-is.
pub fn wrap<O>(observer: &Rc<O>, hook: &str, priority: i32, original: Callback) -> Callback
where
    O: InvocationObserver + 'static,
{
    if original.is_instrumented() {
        return original;
    }

    let observer = Rc::clone(observer);
    let hook: Rc<str> = Rc::from(hook);
    let meta = Rc::clone(original.meta());
    let inner = original.clone();

    let body: Rc<CallbackFn> = Rc::new(
        move |host: &HookRegistry, args: &[HookValue]| -> anyhow::Result<HookValue> {
            let cx = HookContext {
                hook: &hook,
                priority,
                callback: &meta,
                value: filtered_value(args),
            };

            let handle = match observer.before(host, &cx) {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::warn!(hook = cx.hook, "before-event observer failed: {:#}", err);
                    None
                }
            };
            let mut guard = AfterGuard {
                observer: &*observer,
                host,
                cx: &cx,
                handle,
            };

            let result = inner.invoke(host, args);
            guard.finish(match &result {
                Ok(value) => CallOutcome::Returned(value),
                Err(err) => CallOutcome::Failed(err),
            });
            result
        },
    );

    original.instrumented_with(body)
}

/// Registration interceptor that wraps everything it sees
pub struct HookWrapper<O> {
    observer: Rc<O>,
}

impl<O: InvocationObserver + 'static> HookWrapper<O> {
    pub fn new(observer: Rc<O>) -> Self {
        Self { observer }
    }

    pub fn observer(&self) -> &Rc<O> {
        &self.observer
    }

    /// Wrap every registered callback and every future registration
    ///
    /// Returns how many existing callbacks were wrapped.
    pub fn install(self: &Rc<Self>, registry: &HookRegistry) -> usize {
        registry.set_interceptor(Rc::clone(self) as Rc<dyn RegistrationInterceptor>);
        let wrapped = registry.rewrap_all(&**self);
        tracing::debug!(wrapped, "hook wrapper installed");
        wrapped
    }

    /// Stop wrapping and restore every callback to its registered body
    ///
    /// Returns how many callbacks were restored. Afterwards nothing in the
    /// registry refers to this wrapper's observer.
    pub fn uninstall(&self, registry: &HookRegistry) -> usize {
        registry.clear_interceptor();
        let restored = registry.unwrap_all();
        tracing::debug!(restored, "hook wrapper removed");
        restored
    }
}

impl<O: InvocationObserver + 'static> RegistrationInterceptor for HookWrapper<O> {
    fn intercept(&self, hook: &str, priority: i32, callback: Callback) -> Callback {
        wrap(&self.observer, hook, priority, callback)
    }
}
