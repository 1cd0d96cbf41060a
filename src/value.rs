//! Values threaded through hooks
//!
//! Hook arguments and filter values are dynamic, so they are carried as
//! `serde_json::Value`. Modification detection uses deep structural equality:
//!
//! - arrays compare element-wise, in order
//! - objects compare key-by-key, independent of insertion order
//! - numbers compare by representation, so `1` and `1.0` differ (a filter
//!   that turns an integer into a float has modified the value)
//! - strings compare by content
//!
//! Identity never matters: a filter that rebuilds an equal value from scratch
//! has not modified it.

pub use serde_json::Value as HookValue;

/// Whether a filter's output differs from its input
pub fn is_modified(input: &HookValue, output: &HookValue) -> bool {
    input != output
}

static NULL: HookValue = HookValue::Null;

/// The filtered value of a dispatch: its first argument, or `null`
pub fn filtered_value(args: &[HookValue]) -> &HookValue {
    args.first().unwrap_or(&NULL)
}
