//! Per-component timing report as `Server-Timing` headers
//!
//! Invocation durations are summed per owning component (`type:name`),
//! rounded to four decimal places of a second and emitted as one header per
//! component:
//!
//! ```text
//! Server-Timing: plugin;desc="plugin:akismet";dur=2.000000
//! Server-Timing: core;desc="core:wp-includes";dur=5.000000
//! ```
//!
//! Headers are appended, never joined or replaced, so each component stays a
//! separately parseable field.

use std::fmt;

use indexmap::IndexMap;

use crate::invocation::Invocation;

pub const SERVER_TIMING_HEADER: &str = "Server-Timing";

/// Round seconds to four decimal places, half away from zero
pub fn round_to_precision(secs: f64) -> f64 {
    (secs * 10_000.0).round() / 10_000.0
}

/// Summed durations per component, in first-seen order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentTimings {
    totals: IndexMap<String, f64>,
    incomplete: usize,
    unattributed: usize,
}

impl ComponentTimings {
    /// Unrounded total in seconds
    pub fn get(&self, component_key: &str) -> Option<f64> {
        self.totals.get(component_key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.totals.iter().map(|(key, secs)| (key.as_str(), *secs))
    }

    pub fn len(&self) -> usize {
        self.totals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Attributed invocations left out because they never completed
    pub fn incomplete(&self) -> usize {
        self.incomplete
    }

    /// Invocations with no owning component
    pub fn unattributed(&self) -> usize {
        self.unattributed
    }

    /// Rounded header entries
    pub fn entries(&self) -> Vec<ServerTimingEntry> {
        self.iter()
            .map(|(key, secs)| ServerTimingEntry {
                component_key: key.to_string(),
                seconds: round_to_precision(secs),
            })
            .collect()
    }
}

/// Sum invocation durations per owning component
pub fn aggregate(invocations: &[Invocation]) -> ComponentTimings {
    let mut timings = ComponentTimings::default();
    for invocation in invocations {
        let Some(source) = invocation.source_location() else {
            timings.unattributed += 1;
            continue;
        };
        match invocation.duration() {
            Ok(duration) => {
                *timings.totals.entry(source.component_key()).or_insert(0.0) +=
                    duration.as_secs_f64();
            }
            Err(err) => {
                timings.incomplete += 1;
                tracing::debug!("excluding from timings: {}", err);
            }
        }
    }
    timings
}

/// One `Server-Timing` field
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTimingEntry {
    /// `type:name`
    pub component_key: String,
    /// Rounded seconds
    pub seconds: f64,
}

impl ServerTimingEntry {
    /// Metric token: the component type
    pub fn token(&self) -> &str {
        self.component_key
            .split(':')
            .next()
            .unwrap_or(self.component_key.as_str())
    }

    pub fn millis(&self) -> f64 {
        self.seconds * 1000.0
    }
}

impl fmt::Display for ServerTimingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{};desc=\"{}\";dur={:.6}",
            self.token(),
            self.component_key,
            self.millis()
        )
    }
}

/// Destination for response headers; repeated names must be kept
pub trait HeaderSink {
    fn append_header(&mut self, name: &str, value: &str) -> anyhow::Result<()>;
}

impl HeaderSink for Vec<(String, String)> {
    fn append_header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        self.push((name.to_string(), value.to_string()));
        Ok(())
    }
}

impl HeaderSink for http::HeaderMap {
    fn append_header(&mut self, name: &str, value: &str) -> anyhow::Result<()> {
        let name = http::header::HeaderName::from_bytes(name.as_bytes())?;
        let value = http::header::HeaderValue::from_str(value)?;
        self.append(name, value);
        Ok(())
    }
}

/// Emit one `Server-Timing` header per component; returns how many were sent
///
/// Sink failures are logged and skipped.
pub fn send(invocations: &[Invocation], sink: &mut dyn HeaderSink) -> usize {
    let timings = aggregate(invocations);
    if timings.incomplete() > 0 {
        tracing::warn!(
            incomplete = timings.incomplete(),
            "some invocations never completed; their time is not reported"
        );
    }

    let mut sent = 0;
    for entry in timings.entries() {
        match sink.append_header(SERVER_TIMING_HEADER, &entry.to_string()) {
            Ok(()) => sent += 1,
            Err(err) => tracing::warn!(
                component = %entry.component_key,
                "failed to add Server-Timing header: {:#}",
                err
            ),
        }
    }
    sent
}
