//! CLI argument parsing for hooktrace

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::locator::ComponentRoot;

/// Output format for the replayed trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Indented invocation tree plus per-component totals (default)
    Text,
    /// JSON export of every invocation
    Json,
    /// Only the `Server-Timing` header lines
    ServerTiming,
}

#[derive(Parser, Debug)]
#[command(name = "hooktrace")]
#[command(version)]
#[command(about = "Hook invocation tracing with per-component timing attribution", long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Component root, checked before configured roots (repeatable, e.g. --root plugin=/srv/www/wp-content/plugins)
    #[arg(long = "root", value_name = "TYPE=PREFIX")]
    pub roots: Vec<ComponentRoot>,

    /// Install root; adds the conventional mu-plugin/plugin/theme/core layout after all other roots
    #[arg(long = "wordpress", value_name = "ABSPATH")]
    pub wordpress: Option<PathBuf>,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Exit with an error if the trace contains desynchronised events
    #[arg(long = "strict")]
    pub strict: bool,

    /// Enable debug logging to stderr
    #[arg(long = "debug")]
    pub debug: bool,

    /// Recorded trace (JSON lines); `-` reads stdin
    #[arg(value_name = "TRACE_FILE")]
    pub trace: PathBuf,
}
