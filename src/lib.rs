//! Hooktrace - hook invocation tracing with per-component attribution
//!
//! This library wraps every callback registered on an event-hook host,
//! rebuilds the nesting of callback executions into an invocation tree,
//! attributes each callback to the component (plugin, theme, core) that
//! defines it, and reports per-component time as `Server-Timing` headers.

pub mod annotator;
pub mod callback;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod host;
pub mod invocation;
pub mod locator;
pub mod replay;
pub mod server_timing;
pub mod session;
pub mod value;
pub mod watcher;
pub mod wrapper;
