use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "tailguard",
    about = "Tail, filter and highlight local or SSH-remote log files",
    version,
    long_about = "tailguard reads a local log file or a remote one over SSH, drops lines matching exclusion patterns and highlights the rest. Every user-supplied regular expression is checked for catastrophic backtracking shapes before use, and remote paths are validated and shell-escaped."
)]
pub struct Args {
    /// Local path or remote URL ([ssh://]user@host[:port]:/absolute/path)
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Only show the last N lines
    #[arg(short = 'n', long = "tail", value_name = "N")]
    pub tail: Option<usize>,

    /// Keep running and print new lines as the source grows
    #[arg(short = 'f', long = "follow")]
    pub follow: bool,

    /// Hide lines containing this pattern (repeatable)
    #[arg(short = 'e', long = "exclude", value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Treat exclusion patterns as regular expressions
    #[arg(short = 'r', long = "regex")]
    pub regex: bool,

    /// Extra highlight rules (e.g. "timeout:magenta,user=\w+:#ff8800")
    #[arg(short = 'c', long = "color-map")]
    pub color_map: Option<String>,

    /// TOML configuration file
    #[arg(long = "config", env = "TAILGUARD_CONFIG", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Prefix each line with its line number
    #[arg(short = 'l', long = "line-numbers")]
    pub line_numbers: bool,

    /// Disable ANSI colors
    #[arg(long = "no-color")]
    pub no_color: bool,

    /// Change polling interval in milliseconds [default: 500]
    #[arg(long = "poll-interval", value_name = "MS")]
    pub poll_interval: Option<u64>,

    /// Read buffer size in bytes
    #[arg(long = "buffer-size", default_value = "8192")]
    pub buffer_size: usize,

    /// SSH connection timeout in seconds
    #[arg(long = "connect-timeout", value_name = "SECS")]
    pub connect_timeout: Option<u64>,

    /// Follow symbolic links in local paths
    #[arg(long = "allow-symlinks")]
    pub allow_symlinks: bool,
}

impl Args {
    /// Exclusion patterns with surrounding whitespace and empty entries removed.
    pub fn exclusions(&self) -> Vec<String> {
        self.exclude
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Color mappings as (regex, color) pairs. The color follows the last
    /// `:` so that regexes may contain colons.
    pub fn color_mappings(&self) -> Vec<(String, String)> {
        if let Some(ref color_map) = self.color_map {
            color_map
                .split(',')
                .filter_map(|mapping| {
                    let (pattern, color) = mapping.rsplit_once(':')?;
                    let (pattern, color) = (pattern.trim(), color.trim());
                    if pattern.is_empty() || color.is_empty() {
                        None
                    } else {
                        Some((pattern.to_string(), color.to_string()))
                    }
                })
                .collect()
        } else {
            vec![]
        }
    }
}
