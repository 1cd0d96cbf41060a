//! Offline replay of recorded hook traces
//!
//! A trace is a JSON-lines file of host events, one per line:
//!
//! ```text
//! {"event":"action","hook":"init"}
//! {"event":"before","id":1,"hook":"init","priority":10,"callback":{"file":"/srv/www/wp-content/plugins/a/a.php","line":3},"at_us":100}
//! {"event":"after","id":1,"at_us":350}
//! ```
//!
//! `action` marks a hook dispatched as an action (it precedes the callbacks
//! it runs). `before`/`after` bracket one callback execution; `id` is the
//! recorder's own handle and only needs to be unique within the trace.
//! Blank lines and lines starting with `#` are skipped.
//!
//! Malformed lines abort the replay. Desynchronised events are collected as
//! issues and the replay carries on, as a live session would.

use std::collections::HashMap;
use std::io::BufRead;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::callback::{CallbackMeta, CallbackOrigin};
use crate::clock::ManualClock;
use crate::error::ReplayError;
use crate::host::DEFAULT_PRIORITY;
use crate::invocation::{HookKind, InvocationId};
use crate::locator::FileLocator;
use crate::value::HookValue;
use crate::watcher::InvocationWatcher;

/// Callback identity as recorded
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RecordedCallback {
    pub name: Option<String>,
    pub file: Option<String>,
    pub line: u32,
}

impl RecordedCallback {
    fn to_meta(&self) -> CallbackMeta {
        CallbackMeta {
            name: self.name.clone(),
            origin: self.file.as_ref().map(|file| CallbackOrigin {
                file: file.clone(),
                line: self.line,
                column: 0,
            }),
            addr: None,
        }
    }
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

/// One line of a recorded trace
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TraceEvent {
    Action {
        hook: String,
    },
    Before {
        id: u64,
        hook: String,
        #[serde(default = "default_priority")]
        priority: i32,
        #[serde(default)]
        callback: RecordedCallback,
        #[serde(default)]
        value: HookValue,
        at_us: u64,
    },
    After {
        id: u64,
        #[serde(default)]
        value: HookValue,
        /// The callback raised instead of returning
        #[serde(default)]
        failed: bool,
        at_us: u64,
    },
}

impl TraceEvent {
    fn at_us(&self) -> Option<u64> {
        match self {
            Self::Action { .. } => None,
            Self::Before { at_us, .. } | Self::After { at_us, .. } => Some(*at_us),
        }
    }
}

/// Parse one trace line; `Ok(None)` for blank and comment lines
pub fn parse_line(line: &str) -> Result<Option<TraceEvent>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Result of replaying a trace
#[derive(Debug)]
pub struct ReplayOutcome {
    pub watcher: InvocationWatcher,
    /// `did_action` counts observed in the trace
    pub actions: HashMap<String, u64>,
    /// Non-fatal problems, in line order
    pub issues: Vec<ReplayError>,
    pub lines: usize,
}

struct Replayer {
    watcher: InvocationWatcher,
    clock: ManualClock,
    actions: HashMap<String, u64>,
    handles: HashMap<u64, (InvocationId, String)>,
    issues: Vec<ReplayError>,
    last_us: u64,
}

impl Replayer {
    fn new(locator: Arc<FileLocator>) -> Self {
        let clock = ManualClock::new();
        Self {
            watcher: InvocationWatcher::with_clock(locator, clock.clone()),
            clock,
            actions: HashMap::new(),
            handles: HashMap::new(),
            issues: Vec::new(),
            last_us: 0,
        }
    }

    fn apply(&mut self, line: usize, event: TraceEvent) {
        if let Some(at_us) = event.at_us() {
            if at_us < self.last_us {
                self.issues.push(ReplayError::NonMonotonicClock {
                    line,
                    at_us,
                    previous_us: self.last_us,
                });
            } else {
                self.last_us = at_us;
                self.clock.set(Duration::from_micros(at_us));
            }
        }

        match event {
            TraceEvent::Action { hook } => {
                *self.actions.entry(hook).or_insert(0) += 1;
            }
            TraceEvent::Before {
                id,
                hook,
                priority,
                callback,
                value,
                ..
            } => {
                let meta = Rc::new(callback.to_meta());
                let handle = self.watcher.on_before(&hook, priority, &value, &meta);
                self.handles.insert(id, (handle, hook));
            }
            TraceEvent::After {
                id, value, failed, ..
            } => {
                let Some((handle, hook)) = self.handles.get(&id).cloned() else {
                    self.issues.push(ReplayError::UnknownRecordedId { line, id });
                    return;
                };
                let kind = HookKind::derive(&hook, &self.actions);
                let output = (!failed).then_some(&value);
                match self.watcher.on_after(handle, output, kind) {
                    Ok(()) => {
                        self.handles.remove(&id);
                    }
                    Err(source) => self.issues.push(ReplayError::Watcher { line, source }),
                }
            }
        }
    }
}

/// Feed a recorded trace through a fresh watcher
pub fn replay<R: BufRead>(
    reader: R,
    locator: Arc<FileLocator>,
) -> Result<ReplayOutcome, ReplayError> {
    let mut replayer = Replayer::new(locator);
    let mut lines = 0;

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        lines = line_no;
        let event = parse_line(&line).map_err(|source| ReplayError::Parse {
            line: line_no,
            source,
        })?;
        if let Some(event) = event {
            replayer.apply(line_no, event);
        }
    }

    if !replayer.handles.is_empty() {
        tracing::debug!(
            open = replayer.handles.len(),
            "trace ended with invocations still open"
        );
    }
    for issue in &replayer.issues {
        tracing::warn!("{}", issue);
    }

    Ok(ReplayOutcome {
        watcher: replayer.watcher,
        actions: replayer.actions,
        issues: replayer.issues,
        lines,
    })
}
