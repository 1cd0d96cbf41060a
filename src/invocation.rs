//! Invocation model
//!
//! One [`Invocation`] is one observed execution of one registered callback.
//! Invocations live in the watcher's arena and refer to each other by
//! [`InvocationId`]; the parent link is whatever was open when the invocation
//! started, and `children` preserves creation order.

use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::callback::CallbackMeta;
use crate::error::WatcherError;
use crate::host::ActionLog;
use crate::locator::SourceLocation;
use crate::value::HookValue;

/// Duration reported for invocations that never completed
pub const INCOMPLETE_DURATION_SENTINEL: f64 = -1.0;

static NEXT_INVOCATION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique invocation id, increasing in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct InvocationId(pub u64);

impl InvocationId {
    pub(crate) fn next() -> Self {
        Self(NEXT_INVOCATION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether a hook behaves as an action or a filter
///
/// Never stored: the host offers no type tag, so the kind is re-derived from
/// the action log whenever it is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HookKind {
    Action,
    Filter,
}

impl HookKind {
    /// `Action` if the host has dispatched `hook` as an action
    pub fn derive(hook: &str, log: &dyn ActionLog) -> Self {
        if log.did_action(hook) > 0 {
            Self::Action
        } else {
            Self::Filter
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Filter => "filter",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hook-specific part of an invocation
#[derive(Debug, Clone)]
pub struct HookCall {
    /// Hook name
    pub name: String,
    /// Priority the callback was registered at
    pub priority: i32,
    /// Filters only: whether the callback returned a different value
    pub value_modified: Option<bool>,
}

/// One observed callback execution
#[derive(Debug, Clone)]
pub struct Invocation {
    pub(crate) id: InvocationId,
    pub(crate) parent: Option<InvocationId>,
    pub(crate) children: Vec<InvocationId>,
    pub(crate) depth: usize,
    pub(crate) start: Duration,
    pub(crate) end: Option<Duration>,
    pub(crate) callback: Rc<CallbackMeta>,
    pub(crate) source: Option<Arc<SourceLocation>>,
    pub(crate) hook: HookCall,
    pub(crate) input: Option<HookValue>,
}

impl Invocation {
    pub fn id(&self) -> InvocationId {
        self.id
    }

    pub fn parent(&self) -> Option<InvocationId> {
        self.parent
    }

    pub fn children(&self) -> &[InvocationId] {
        &self.children
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Nesting depth, 0 for roots
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn start_time(&self) -> Duration {
        self.start
    }

    pub fn end_time(&self) -> Option<Duration> {
        self.end
    }

    pub fn is_complete(&self) -> bool {
        self.end.is_some()
    }

    /// Elapsed time, or an error if the after-event never arrived
    pub fn duration(&self) -> Result<Duration, WatcherError> {
        match self.end {
            Some(end) => Ok(end.saturating_sub(self.start)),
            None => Err(WatcherError::IncompleteInvocation(self.id)),
        }
    }

    /// Duration in seconds, with [`INCOMPLETE_DURATION_SENTINEL`] for incomplete invocations
    pub fn duration_secs_or_sentinel(&self) -> f64 {
        self.duration()
            .map(|d| d.as_secs_f64())
            .unwrap_or(INCOMPLETE_DURATION_SENTINEL)
    }

    pub fn callback(&self) -> &CallbackMeta {
        &self.callback
    }

    /// Owning component, `None` when unattributed
    pub fn source_location(&self) -> Option<&SourceLocation> {
        self.source.as_deref()
    }

    pub fn hook(&self) -> &HookCall {
        &self.hook
    }

    pub fn name(&self) -> &str {
        &self.hook.name
    }

    pub fn priority(&self) -> i32 {
        self.hook.priority
    }

    pub fn value_modified(&self) -> Option<bool> {
        self.hook.value_modified
    }

    pub fn kind(&self, log: &dyn ActionLog) -> HookKind {
        HookKind::derive(&self.hook.name, log)
    }

    /// Actions may print; filters are expected to return instead
    pub fn can_output(&self, log: &dyn ActionLog) -> bool {
        self.kind(log) == HookKind::Action
    }

    /// Serialisable view of this invocation
    pub fn export(&self, log: &dyn ActionLog) -> InvocationRecord {
        let kind = self.kind(log);
        InvocationRecord {
            index: self.id,
            kind,
            name: self.hook.name.clone(),
            priority: self.hook.priority,
            callback: self.callback.label(),
            parent: self.parent,
            children: self.children.clone(),
            duration: self.duration().ok().map(|d| d.as_secs_f64()),
            incomplete: !self.is_complete(),
            source: self.source.as_deref().cloned(),
            filter: match kind {
                HookKind::Filter => Some(FilterFields {
                    value_modified: self.hook.value_modified,
                }),
                HookKind::Action => None,
            },
        }
    }
}

/// Exported invocation, as written by `--format json`
#[derive(Debug, Clone, Serialize)]
pub struct InvocationRecord {
    pub index: InvocationId,
    #[serde(rename = "type")]
    pub kind: HookKind,
    pub name: String,
    pub priority: i32,
    pub callback: String,
    pub parent: Option<InvocationId>,
    pub children: Vec<InvocationId>,
    /// Seconds; `null` when incomplete
    pub duration: Option<f64>,
    pub incomplete: bool,
    pub source: Option<SourceLocation>,
    #[serde(flatten)]
    pub filter: Option<FilterFields>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterFields {
    pub value_modified: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locator::ComponentType;
    use std::collections::HashMap;

    fn invocation(name: &str, end: Option<Duration>) -> Invocation {
        Invocation {
            id: InvocationId::next(),
            parent: None,
            children: Vec::new(),
            depth: 0,
            start: Duration::from_millis(10),
            end,
            callback: Rc::new(CallbackMeta::anonymous()),
            source: None,
            hook: HookCall {
                name: name.to_string(),
                priority: 10,
                value_modified: None,
            },
            input: None,
        }
    }

    #[test]
    fn test_ids_strictly_increase() {
        let a = InvocationId::next();
        let b = InvocationId::next();
        assert!(b > a);
    }

    #[test]
    fn test_kind_derived_from_action_log() {
        let mut log = HashMap::new();
        log.insert("wp_head".to_string(), 1u64);
        assert_eq!(HookKind::derive("wp_head", &log), HookKind::Action);
        assert_eq!(HookKind::derive("the_title", &log), HookKind::Filter);
    }

    #[test]
    fn test_kind_is_not_stored() {
        let inv = invocation("late_action", Some(Duration::from_millis(12)));
        let mut log: HashMap<String, u64> = HashMap::new();
        assert_eq!(inv.kind(&log), HookKind::Filter);
        log.insert("late_action".to_string(), 1);
        assert_eq!(inv.kind(&log), HookKind::Action);
        assert!(inv.can_output(&log));
    }

    #[test]
    fn test_duration_of_complete_invocation() {
        let inv = invocation("x", Some(Duration::from_millis(15)));
        assert_eq!(inv.duration().unwrap(), Duration::from_millis(5));
        assert!((inv.duration_secs_or_sentinel() - 0.005).abs() < 1e-12);
    }

    #[test]
    fn test_duration_of_incomplete_invocation() {
        let inv = invocation("x", None);
        assert_eq!(
            inv.duration(),
            Err(WatcherError::IncompleteInvocation(inv.id()))
        );
        assert_eq!(inv.duration_secs_or_sentinel(), INCOMPLETE_DURATION_SENTINEL);
    }

    #[test]
    fn test_export_includes_value_modified_only_for_filters() {
        let mut inv = invocation("title", Some(Duration::from_millis(11)));
        inv.hook.value_modified = Some(true);
        inv.source = Some(Arc::new(SourceLocation {
            component_type: ComponentType::Plugin,
            component_name: "seo".to_string(),
            file_path: "/srv/plugins/seo/seo.rs".into(),
        }));

        let log: HashMap<String, u64> = HashMap::new();
        let json = serde_json::to_value(inv.export(&log)).unwrap();
        assert_eq!(json["type"], "filter");
        assert_eq!(json["value_modified"], true);
        assert_eq!(json["source"]["type"], "plugin");
        assert_eq!(json["incomplete"], false);

        let mut log = log;
        log.insert("title".to_string(), 1);
        let json = serde_json::to_value(inv.export(&log)).unwrap();
        assert_eq!(json["type"], "action");
        assert!(json.get("value_modified").is_none());
    }

    #[test]
    fn test_export_of_incomplete_filter_has_null_fields() {
        let inv = invocation("title", None);
        let log: HashMap<String, u64> = HashMap::new();
        let json = serde_json::to_value(inv.export(&log)).unwrap();
        assert!(json["duration"].is_null());
        assert_eq!(json["incomplete"], true);
        assert!(json["value_modified"].is_null());
        assert!(json.get("value_modified").is_some());
    }
}
