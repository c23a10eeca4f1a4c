use crate::security::{secure_compile, SafeMatcher, SecurityPolicy};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

/// One exclusion rule. A regex rule that failed validation is kept so it
/// can be listed, but it never matches.
#[derive(Debug, Clone)]
pub struct ExclusionPattern {
    text: String,
    is_regex: bool,
    matcher: Option<SafeMatcher>,
    error: Option<String>,
}

impl ExclusionPattern {
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_regex(&self) -> bool {
        self.is_regex
    }

    pub fn is_valid(&self) -> bool {
        self.error.is_none()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Case-sensitive. Literal rules match by substring.
    pub fn matches(&self, line: &str) -> bool {
        if !self.is_regex {
            return line.contains(self.text.as_str());
        }
        match &self.matcher {
            Some(matcher) => matcher.is_match(line),
            None => false,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExclusionEngine {
    policy: SecurityPolicy,
    patterns: Vec<ExclusionPattern>,
    excluded: AtomicUsize,
}

impl ExclusionEngine {
    pub fn new(policy: SecurityPolicy) -> Self {
        Self {
            policy,
            patterns: Vec::new(),
            excluded: AtomicUsize::new(0),
        }
    }

    pub fn with_patterns<I, S>(policy: SecurityPolicy, patterns: I, is_regex: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut engine = Self::new(policy);
        for pattern in patterns {
            engine.add(pattern.as_ref(), is_regex);
        }
        engine
    }

    /// Store a rule. Returns false for empty or duplicate text. An unsafe
    /// regex is stored inert; see [`ExclusionEngine::validate_pattern`].
    pub fn add(&mut self, text: &str, is_regex: bool) -> bool {
        if text.is_empty() || self.patterns.iter().any(|p| p.text == text) {
            return false;
        }

        let (matcher, error) = if is_regex {
            match secure_compile(text, &self.policy) {
                Ok(matcher) => (Some(matcher), None),
                Err(e) => {
                    warn!(error = %e, "exclusion pattern stored but disabled");
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        debug!(is_regex, valid = error.is_none(), "added exclusion pattern");
        self.patterns.push(ExclusionPattern {
            text: text.to_string(),
            is_regex,
            matcher,
            error,
        });
        true
    }

    /// Whether `text` would make a working rule, with a reason if not.
    pub fn validate_pattern(&self, text: &str, is_regex: bool) -> (bool, Option<String>) {
        if text.is_empty() {
            return (false, Some("Pattern cannot be empty".to_string()));
        }
        if !is_regex {
            return (true, None);
        }
        match secure_compile(text, &self.policy) {
            Ok(_) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        }
    }

    pub fn remove(&mut self, text: &str) -> bool {
        let before = self.patterns.len();
        self.patterns.retain(|p| p.text != text);
        self.patterns.len() != before
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    /// Rules in insertion order.
    pub fn patterns(&self) -> &[ExclusionPattern] {
        &self.patterns
    }

    pub fn get(&self, text: &str) -> Option<&ExclusionPattern> {
        self.patterns.iter().find(|p| p.text == text)
    }

    /// Whether the stored rule `text` is active. Unknown rules are not valid.
    pub fn is_valid(&self, text: &str) -> bool {
        self.get(text).is_some_and(ExclusionPattern::is_valid)
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Blank lines are never excluded.
    pub fn should_exclude(&self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        self.patterns.iter().any(|p| p.matches(line))
    }

    /// Keep lines that no rule excludes, counting the rest.
    pub fn filter<I, T>(&self, lines: I) -> Vec<T>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut dropped = 0;
        let kept = lines
            .into_iter()
            .filter(|line| {
                let exclude = self.should_exclude(line.as_ref());
                dropped += usize::from(exclude);
                !exclude
            })
            .collect();
        self.excluded.fetch_add(dropped, Ordering::Relaxed);
        kept
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded.load(Ordering::Relaxed)
    }

    pub fn reset_count(&self) {
        self.excluded.store(0, Ordering::Relaxed);
    }

    pub fn policy(&self) -> &SecurityPolicy {
        &self.policy
    }
}
