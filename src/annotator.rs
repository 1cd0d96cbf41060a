//! Output attribution
//!
//! Records which invocation was open while each byte of output was produced.
//! The ledger is a side channel: output is stored verbatim and the mapping is
//! kept as byte ranges, so nothing is injected into the response itself.

use std::ops::Range;

use serde::Serialize;

use crate::invocation::InvocationId;
use crate::watcher::InvocationWatcher;

/// A contiguous output region produced under one invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSpan {
    pub range: Range<usize>,
    /// `None` for output emitted outside any hook
    pub invocation: Option<InvocationId>,
}

/// Buffered output with per-range attribution
#[derive(Debug, Default)]
pub struct OutputLedger {
    buffer: Vec<u8>,
    spans: Vec<OutputSpan>,
}

impl OutputLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append output, attributing it to the watcher's current invocation
    pub fn write(&mut self, watcher: &InvocationWatcher, bytes: &[u8]) {
        self.write_as(watcher.current(), bytes);
    }

    /// Append output attributed to an explicit invocation
    pub fn write_as(&mut self, invocation: Option<InvocationId>, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let start = self.buffer.len();
        self.buffer.extend_from_slice(bytes);
        let end = self.buffer.len();

        match self.spans.last_mut() {
            Some(last) if last.invocation == invocation && last.range.end == start => {
                last.range.end = end;
            }
            _ => self.spans.push(OutputSpan {
                range: start..end,
                invocation,
            }),
        }
    }

    pub fn output(&self) -> &[u8] {
        &self.buffer
    }

    pub fn spans(&self) -> &[OutputSpan] {
        &self.spans
    }

    /// Output bytes produced directly by `id`
    pub fn output_of(&self, id: InvocationId) -> Vec<u8> {
        self.spans
            .iter()
            .filter(|span| span.invocation == Some(id))
            .flat_map(|span| self.buffer[span.range.clone()].iter().copied())
            .collect()
    }

    /// Invocations that produced any output, in first-output order
    pub fn producers(&self) -> Vec<InvocationId> {
        let mut seen = Vec::new();
        for id in self.spans.iter().filter_map(|span| span.invocation) {
            if !seen.contains(&id) {
                seen.push(id);
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackMeta;
    use crate::invocation::HookKind;
    use crate::locator::{FileLocator, RootTable};
    use serde_json::json;
    use std::rc::Rc;
    use std::sync::Arc;

    #[test]
    fn test_output_attributed_to_open_invocation() {
        let watcher = InvocationWatcher::new(Arc::new(FileLocator::new(RootTable::default())));
        let meta = Rc::new(CallbackMeta::anonymous());
        let mut ledger = OutputLedger::new();

        ledger.write(&watcher, b"<html>");
        let body = watcher.on_before("body", 10, &json!(null), &meta);
        ledger.write(&watcher, b"<main ");
        let attrs = watcher.on_before("extra_attrs", 10, &json!(null), &meta);
        ledger.write(&watcher, b"data-x=1");
        watcher.on_after(attrs, None, HookKind::Action).unwrap();
        ledger.write(&watcher, b">");
        ledger.write(&watcher, b"</main>");
        watcher.on_after(body, None, HookKind::Action).unwrap();
        ledger.write(&watcher, b"</html>");

        let spans = ledger.spans();
        assert_eq!(spans.len(), 5);
        assert_eq!(spans[0].invocation, None);
        assert_eq!(spans[1].invocation, Some(body));
        assert_eq!(spans[2].invocation, Some(attrs));
        // adjacent writes under the same invocation merge
        assert_eq!(spans[3].invocation, Some(body));
        assert_eq!(&ledger.output()[spans[3].range.clone()], b"></main>");

        assert_eq!(ledger.output_of(body), b"<main ></main>".to_vec());
        assert_eq!(ledger.output_of(attrs), b"data-x=1".to_vec());
        assert_eq!(ledger.producers(), vec![body, attrs]);
        assert_eq!(ledger.output(), b"<html><main data-x=1></main></html>");
    }

    #[test]
    fn test_empty_writes_are_ignored() {
        let mut ledger = OutputLedger::new();
        ledger.write_as(None, b"");
        assert!(ledger.spans().is_empty());
    }
}
