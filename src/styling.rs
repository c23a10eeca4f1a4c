//! Priority-ordered decoration of log lines.
//!
//! Patterns belong to one of three categories. Every pattern in an earlier
//! category outranks every pattern in a later one, and declaration order
//! breaks ties inside a category. A match that overlaps a range already
//! claimed by a higher-ranked match is dropped. Spans are byte offsets into
//! the line, which is never modified.

use crate::security::{secure_compile, SafeMatcher, SecurityPolicy};
use lru::LruCache;
use parking_lot::Mutex;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use termcolor::{Color, ColorSpec};
use tracing::{debug, warn};

pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Style {
    pub color: Option<Color>,
    pub background: Option<Color>,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
}

impl Style {
    pub fn fg(color: Color) -> Self {
        Self {
            color: Some(color),
            ..Self::default()
        }
    }

    pub fn bold(mut self) -> Self {
        self.bold = true;
        self
    }

    pub fn color_spec(&self) -> ColorSpec {
        let mut spec = ColorSpec::new();
        spec.set_fg(self.color)
            .set_bg(self.background)
            .set_bold(self.bold)
            .set_italic(self.italic)
            .set_underline(self.underline);
        spec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    Patterns,
    Timestamps,
    Custom,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Patterns, Category::Timestamps, Category::Custom];

    /// Lower ranks win overlaps.
    pub fn priority(self) -> usize {
        match self {
            Category::Patterns => 0,
            Category::Timestamps => 1,
            Category::Custom => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Category::Patterns => "patterns",
            Category::Timestamps => "timestamps",
            Category::Custom => "custom",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A configured, not yet compiled, styling rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedPattern {
    pub name: String,
    pub pattern: String,
    pub style: Style,
}

impl NamedPattern {
    pub fn new(name: impl Into<String>, pattern: impl Into<String>, style: Style) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            style,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StylingConfig {
    pub patterns: Vec<NamedPattern>,
    pub timestamps: Vec<NamedPattern>,
    pub custom: Vec<NamedPattern>,
}

impl StylingConfig {
    fn category(&self, category: Category) -> &[NamedPattern] {
        match category {
            Category::Patterns => &self.patterns,
            Category::Timestamps => &self.timestamps,
            Category::Custom => &self.custom,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub matcher: SafeMatcher,
    pub style: Style,
    pub priority: usize,
    pub category: Category,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub style: Style,
}

impl Span {
    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start < end && start < self.end
    }
}

/// A line with its decoration spans, sorted by start offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledLine {
    pub text: String,
    pub spans: Vec<Span>,
}

impl StyledLine {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            spans: Vec::new(),
        }
    }

    /// Consecutive pieces of the text with their style, if any.
    pub fn segments(&self) -> Vec<(&str, Option<&Style>)> {
        let mut segments = Vec::with_capacity(self.spans.len() * 2 + 1);
        let mut cursor = 0;
        for span in &self.spans {
            if span.start > cursor {
                segments.push((&self.text[cursor..span.start], None));
            }
            segments.push((&self.text[span.start..span.end], Some(&span.style)));
            cursor = span.end;
        }
        if cursor < self.text.len() {
            segments.push((&self.text[cursor..], None));
        }
        segments
    }
}

pub struct StylingEngine {
    policy: SecurityPolicy,
    compiled: Vec<CompiledPattern>,
    cache: Mutex<LruCache<String, Arc<StyledLine>>>,
}

impl fmt::Debug for StylingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StylingEngine")
            .field("patterns", &self.compiled.len())
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl StylingEngine {
    pub fn new(config: &StylingConfig, policy: SecurityPolicy) -> Self {
        Self::with_cache_capacity(config, policy, DEFAULT_CACHE_CAPACITY)
    }

    /// Patterns that fail validation or compilation are logged and skipped.
    pub fn with_cache_capacity(
        config: &StylingConfig,
        policy: SecurityPolicy,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let mut compiled = Vec::new();

        for category in Category::ALL {
            for entry in config.category(category) {
                match secure_compile(&entry.pattern, &policy) {
                    Ok(matcher) => compiled.push(CompiledPattern {
                        name: entry.name.clone(),
                        matcher,
                        style: entry.style.clone(),
                        priority: category.priority(),
                        category,
                    }),
                    Err(e) => {
                        warn!(name = %entry.name, %category, error = %e, "skipping styling pattern")
                    }
                }
            }
        }

        debug!(count = compiled.len(), "compiled styling patterns");
        Self {
            policy,
            compiled,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn apply_styling(&self, line: &str) -> StyledLine {
        let mut spans: Vec<Span> = Vec::new();

        for pattern in &self.compiled {
            for range in pattern.matcher.find_ranges(line) {
                if spans.iter().any(|s| s.overlaps(range.start, range.end)) {
                    continue;
                }
                spans.push(Span {
                    start: range.start,
                    end: range.end,
                    style: pattern.style.clone(),
                });
            }
        }

        spans.sort_by_key(|s| s.start);
        StyledLine {
            text: line.to_string(),
            spans,
        }
    }

    /// Same result as [`StylingEngine::apply_styling`], memoized by line text.
    pub fn apply_styling_cached(&self, line: &str) -> Arc<StyledLine> {
        if let Some(hit) = self.cache.lock().get(line) {
            return Arc::clone(hit);
        }

        let styled = Arc::new(self.apply_styling(line));
        self.cache.lock().put(line.to_string(), Arc::clone(&styled));
        styled
    }

    /// Add or replace a runtime pattern. Returns false if it does not compile
    /// or is rejected as unsafe.
    pub fn add_custom_pattern(&mut self, name: &str, regex: &str, style: Style) -> bool {
        let matcher = match secure_compile(regex, &self.policy) {
            Ok(matcher) => matcher,
            Err(e) => {
                debug!(name, error = %e, "custom pattern rejected");
                return false;
            }
        };

        let pattern = CompiledPattern {
            name: name.to_string(),
            matcher,
            style,
            priority: Category::Custom.priority(),
            category: Category::Custom,
        };

        match self
            .compiled
            .iter_mut()
            .find(|p| p.category == Category::Custom && p.name == name)
        {
            Some(existing) => *existing = pattern,
            None => self.compiled.push(pattern),
        }

        self.cache.lock().clear();
        true
    }

    pub fn remove_custom_pattern(&mut self, name: &str) -> bool {
        let before = self.compiled.len();
        self.compiled
            .retain(|p| !(p.category == Category::Custom && p.name == name));
        let removed = self.compiled.len() != before;
        if removed {
            self.cache.lock().clear();
        }
        removed
    }

    pub fn validate_pattern(&self, regex: &str) -> (bool, Option<String>) {
        match secure_compile(regex, &self.policy) {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        }
    }

    /// Active patterns in the order they are applied.
    pub fn compiled_patterns(&self) -> &[CompiledPattern] {
        &self.compiled
    }

    pub fn pattern_names(&self, category: Category) -> Vec<&str> {
        self.compiled
            .iter()
            .filter(|p| p.category == category)
            .map(|p| p.name.as_str())
            .collect()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }

    pub fn cached_lines(&self) -> usize {
        self.cache.lock().len()
    }
}
