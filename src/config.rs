//! Runtime configuration: CLI arguments layered over an optional TOML file.

use crate::cli::Args;
use crate::security::{secure_compile, SecurityPolicy};
use crate::source::path::validate_local_path;
use crate::source::{PathPolicy, SourceOptions, SshOptions};
use crate::styling::{NamedPattern, Style, StylingConfig, DEFAULT_CACHE_CAPACITY};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termcolor::Color;
use tracing::debug;

const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
const MAX_CONFIG_FILE_SIZE: u64 = 1024 * 1024;

/// One exclusion rule as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionRule {
    pub text: String,
    pub is_regex: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub source: String,
    pub follow: bool,
    pub exclusions: Vec<ExclusionRule>,
    pub styling: StylingConfig,
    pub security: SecurityPolicy,
    pub source_options: SourceOptions,
    pub show_line_numbers: bool,
    pub no_color: bool,
    pub poll_interval: u64,
    pub cache_size: usize,
}

impl Config {
    pub fn from_args(args: &Args) -> Result<Self> {
        let file = match args.config.clone().or_else(default_config_path) {
            Some(path) => FileConfig::load(&path, args.allow_symlinks)?,
            None => FileConfig::default(),
        };

        let security = file.security.policy()?;
        security
            .validate()
            .context("Invalid [security] settings")?;

        let mut exclusions: Vec<ExclusionRule> = file
            .exclusions
            .patterns
            .iter()
            .map(|text| ExclusionRule {
                text: text.clone(),
                is_regex: file.exclusions.regex,
            })
            .collect();
        exclusions.extend(args.exclusions().into_iter().map(|text| ExclusionRule {
            text,
            is_regex: args.regex,
        }));
        Self::check_exclusions(&exclusions, &security)?;

        let mut styling = file.styling.build()?;
        for (pattern, color_name) in args.color_mappings() {
            secure_compile(&pattern, &security)
                .with_context(|| format!("Invalid regex pattern: {}", pattern))?;
            let color = Self::parse_color(&color_name)?;
            styling
                .custom
                .push(NamedPattern::new(pattern.clone(), pattern, Style::fg(color)));
        }

        let source_options = SourceOptions {
            tail: args.tail.or(file.app.tail_lines),
            buffer_size: args.buffer_size,
            path_policy: PathPolicy {
                allow_symlinks: args.allow_symlinks || file.display.allow_symlinks,
                max_file_size: file
                    .display
                    .max_file_size
                    .unwrap_or(PathPolicy::default().max_file_size),
            },
            ssh: file.ssh.options(args.connect_timeout),
        };

        Ok(Config {
            source: args.source.clone(),
            follow: args.follow || file.app.follow,
            exclusions,
            styling,
            security,
            source_options,
            show_line_numbers: args.line_numbers || file.display.show_line_numbers,
            no_color: args.no_color,
            poll_interval: args
                .poll_interval
                .or(file.display.poll_interval)
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            cache_size: file.display.cache_size.unwrap_or(DEFAULT_CACHE_CAPACITY),
        })
    }

    /// Regex exclusions must compile and pass the safety checks.
    fn check_exclusions(rules: &[ExclusionRule], policy: &SecurityPolicy) -> Result<()> {
        for rule in rules.iter().filter(|r| r.is_regex) {
            secure_compile(&rule.text, policy)
                .with_context(|| format!("Invalid regex pattern: {}", rule.text))?;
        }
        Ok(())
    }

    /// Named colors, `#rrggbb`, or an ANSI 256-color index.
    pub fn parse_color(color_name: &str) -> Result<Color> {
        let name = color_name.trim().to_lowercase();
        match name.as_str() {
            "black" => Ok(Color::Black),
            "red" => Ok(Color::Red),
            "green" => Ok(Color::Green),
            "yellow" => Ok(Color::Yellow),
            "blue" => Ok(Color::Blue),
            "magenta" => Ok(Color::Magenta),
            "cyan" => Ok(Color::Cyan),
            "white" => Ok(Color::White),
            hex if hex.starts_with('#') && hex.len() == 7 => {
                let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16);
                match (channel(1), channel(3), channel(5)) {
                    (Ok(r), Ok(g), Ok(b)) => Ok(Color::Rgb(r, g, b)),
                    _ => Err(anyhow!("Unknown color: {}", color_name)),
                }
            }
            index => index
                .parse::<u8>()
                .map(Color::Ansi256)
                .map_err(|_| anyhow!("Unknown color: {}", color_name)),
        }
    }
}

/// Built-in level and timestamp highlighting.
pub fn default_styling() -> StylingConfig {
    StylingConfig {
        patterns: vec![
            NamedPattern::new(
                "error",
                r"\b(?:ERROR|FATAL|CRITICAL)\b",
                Style::fg(Color::Red).bold(),
            ),
            NamedPattern::new("warning", r"\b(?:WARN|WARNING)\b", Style::fg(Color::Yellow).bold()),
            NamedPattern::new("info", r"\bINFO\b", Style::fg(Color::Green)),
            NamedPattern::new("debug", r"\b(?:DEBUG|TRACE)\b", Style::fg(Color::Cyan)),
        ],
        timestamps: vec![
            NamedPattern::new(
                "iso_datetime",
                r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:[.,]\d+)?",
                Style::fg(Color::Blue),
            ),
            NamedPattern::new("time", r"\b\d{2}:\d{2}:\d{2}\b", Style::fg(Color::Blue)),
        ],
        custom: Vec::new(),
    }
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?.join("tailguard").join("config.toml");
    path.is_file().then_some(path)
}

/// `~/` prefixed paths are resolved against the home directory.
fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    app: AppSection,
    security: SecuritySection,
    ssh: SshSection,
    exclusions: ExclusionSection,
    styling: StylingSection,
    display: DisplaySection,
}

impl FileConfig {
    /// Config paths get the same traversal and symlink checks as log files,
    /// with a much smaller size limit.
    fn load(path: &Path, allow_symlinks: bool) -> Result<Self> {
        let policy = PathPolicy {
            allow_symlinks,
            max_file_size: MAX_CONFIG_FILE_SIZE,
        };
        validate_local_path(path, &policy)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AppSection {
    tail_lines: Option<usize>,
    follow: bool,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SecuritySection {
    max_pattern_length: usize,
    max_quantifier_nesting: usize,
    max_alternation_groups: usize,
    regex_compilation_timeout: f64,
    regex_execution_timeout: f64,
    enable_complexity_analysis: bool,
    enable_timeout_protection: bool,
}

impl Default for SecuritySection {
    fn default() -> Self {
        let policy = SecurityPolicy::default();
        Self {
            max_pattern_length: policy.max_pattern_length,
            max_quantifier_nesting: policy.max_quantifier_nesting,
            max_alternation_groups: policy.max_alternation_groups,
            regex_compilation_timeout: policy.compile_timeout.as_secs_f64(),
            regex_execution_timeout: policy.execute_timeout.as_secs_f64(),
            enable_complexity_analysis: policy.analysis_enabled,
            enable_timeout_protection: policy.timeout_protection_enabled,
        }
    }
}

impl SecuritySection {
    fn policy(&self) -> Result<SecurityPolicy> {
        let seconds = |field: &str, value: f64| {
            Duration::try_from_secs_f64(value)
                .map_err(|_| anyhow!("Invalid [security] settings: {} must be a positive number of seconds", field))
        };

        Ok(SecurityPolicy {
            max_pattern_length: self.max_pattern_length,
            max_quantifier_nesting: self.max_quantifier_nesting,
            max_alternation_groups: self.max_alternation_groups,
            compile_timeout: seconds("regex_compilation_timeout", self.regex_compilation_timeout)?,
            execute_timeout: seconds("regex_execution_timeout", self.regex_execution_timeout)?,
            analysis_enabled: self.enable_complexity_analysis,
            timeout_protection_enabled: self.enable_timeout_protection,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SshSection {
    connection_timeout: Option<u64>,
    known_hosts_files: Option<Vec<PathBuf>>,
    identity_files: Option<Vec<PathBuf>>,
    use_agent: Option<bool>,
}

impl SshSection {
    fn options(&self, connect_timeout: Option<u64>) -> SshOptions {
        let mut options = SshOptions::default();
        if let Some(secs) = connect_timeout.or(self.connection_timeout) {
            options.connection_timeout = Duration::from_secs(secs);
        }
        if let Some(files) = &self.known_hosts_files {
            options.known_hosts_files = files.iter().map(|p| expand_home(p)).collect();
        }
        if let Some(files) = &self.identity_files {
            options.identity_files = files.iter().map(|p| expand_home(p)).collect();
        }
        if let Some(use_agent) = self.use_agent {
            options.use_agent = use_agent;
        }
        options
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ExclusionSection {
    patterns: Vec<String>,
    regex: bool,
}

/// Each present category replaces the built-in one. Tables keep their
/// declaration order, which is the tie-break order inside a category.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StylingSection {
    patterns: Option<toml::Table>,
    timestamps: Option<toml::Table>,
    custom: Option<toml::Table>,
}

impl StylingSection {
    fn build(&self) -> Result<StylingConfig> {
        let defaults = default_styling();
        Ok(StylingConfig {
            patterns: category_or(&self.patterns, defaults.patterns, "patterns")?,
            timestamps: category_or(&self.timestamps, defaults.timestamps, "timestamps")?,
            custom: category_or(&self.custom, defaults.custom, "custom")?,
        })
    }
}

fn category_or(
    table: &Option<toml::Table>,
    default: Vec<NamedPattern>,
    category: &str,
) -> Result<Vec<NamedPattern>> {
    let Some(table) = table else {
        return Ok(default);
    };

    table
        .iter()
        .map(|(name, value)| {
            let entry: StyleEntry = value
                .clone()
                .try_into()
                .with_context(|| format!("Invalid style [styling.{}.{}]", category, name))?;
            entry
                .into_pattern(name)
                .with_context(|| format!("Invalid style [styling.{}.{}]", category, name))
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StyleEntry {
    pattern: String,
    color: Option<String>,
    background: Option<String>,
    #[serde(default)]
    bold: bool,
    #[serde(default)]
    italic: bool,
    #[serde(default)]
    underline: bool,
}

impl StyleEntry {
    fn into_pattern(self, name: &str) -> Result<NamedPattern> {
        let style = Style {
            color: self.color.as_deref().map(Config::parse_color).transpose()?,
            background: self.background.as_deref().map(Config::parse_color).transpose()?,
            bold: self.bold,
            italic: self.italic,
            underline: self.underline,
        };
        Ok(NamedPattern::new(name, self.pattern, style))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DisplaySection {
    show_line_numbers: bool,
    poll_interval: Option<u64>,
    cache_size: Option<usize>,
    allow_symlinks: bool,
    max_file_size: Option<u64>,
}
