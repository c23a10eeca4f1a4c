//! Regex safety: static analysis, bounded compilation and bounded matching.
//!
//! Matching runs on the `regex` crate, whose engine is linear in the size of
//! the input, so a pattern can never backtrack catastrophically once it has
//! been compiled. The static checks below still reject the classic ReDoS
//! shapes early so that a pattern which is dangerous elsewhere is never
//! accepted into a configuration, and so that over-long input is refused
//! before any compilation work is done.

use crate::error::{PatternError, PolicyError};
use regex::{Regex, RegexBuilder};
use std::ops::Range;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on the compiled program size handed to the regex builder.
const COMPILED_SIZE_LIMIT: usize = 2 * 1024 * 1024;

/// Limits applied to every user-supplied pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityPolicy {
    pub max_pattern_length: usize,
    /// Number of repetition quantifiers that may be stacked on top of each
    /// other. `a+` has depth 1, `(a+)+` depth 2.
    pub max_quantifier_nesting: usize,
    pub max_alternation_groups: usize,
    pub compile_timeout: Duration,
    pub execute_timeout: Duration,
    pub analysis_enabled: bool,
    pub timeout_protection_enabled: bool,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            max_pattern_length: 1000,
            max_quantifier_nesting: 1,
            max_alternation_groups: 10,
            compile_timeout: Duration::from_secs(1),
            execute_timeout: Duration::from_millis(500),
            analysis_enabled: true,
            timeout_protection_enabled: true,
        }
    }
}

impl SecurityPolicy {
    /// Check every limit against its accepted range.
    pub fn validate(&self) -> Result<(), PolicyError> {
        check_range("max_pattern_length", self.max_pattern_length, 10, 10_000)?;
        check_range("max_quantifier_nesting", self.max_quantifier_nesting, 1, 10)?;
        check_range("max_alternation_groups", self.max_alternation_groups, 1, 100)?;
        check_secs("compile_timeout", self.compile_timeout, 0.1, 10.0)?;
        check_secs("execute_timeout", self.execute_timeout, 0.1, 5.0)?;
        Ok(())
    }
}

fn check_range(
    field: &'static str,
    value: usize,
    min: usize,
    max: usize,
) -> Result<(), PolicyError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(PolicyError {
            field,
            min: min.to_string(),
            max: max.to_string(),
            value: value.to_string(),
        })
    }
}

fn check_secs(field: &'static str, value: Duration, min: f64, max: f64) -> Result<(), PolicyError> {
    let secs = value.as_secs_f64();
    if secs >= min && secs <= max {
        Ok(())
    } else {
        Err(PolicyError {
            field,
            min: format!("{min}s"),
            max: format!("{max}s"),
            value: format!("{secs}s"),
        })
    }
}

/// Statically check `pattern` against `policy`.
///
/// Returns the reason for rejection when the pattern is unsafe. Checks run
/// in a fixed order and the first failure wins: length, quantifier nesting,
/// alternation width, then known catastrophic shapes.
pub fn validate(pattern: &str, policy: &SecurityPolicy) -> Result<(), String> {
    let length = pattern.chars().count();
    if length > policy.max_pattern_length {
        return Err(format!(
            "pattern length {} exceeds maximum length of {}",
            length, policy.max_pattern_length
        ));
    }

    if !policy.analysis_enabled {
        return Ok(());
    }

    let analysis = Analysis::of(pattern);

    if analysis.too_deep {
        return Err(format!(
            "groups nested deeper than {} levels",
            MAX_GROUP_DEPTH
        ));
    }

    if analysis.max_nesting > policy.max_quantifier_nesting {
        return Err(format!(
            "nested quantifiers (depth {}) exceed the limit of {}",
            analysis.max_nesting, policy.max_quantifier_nesting
        ));
    }

    if analysis.max_branches > policy.max_alternation_groups {
        return Err(format!(
            "too many alternation branches in one group ({} > {})",
            analysis.max_branches, policy.max_alternation_groups
        ));
    }

    if let Some(shape) = analysis.dangerous {
        return Err(shape.to_string());
    }

    Ok(())
}

pub fn is_safe(pattern: &str, policy: &SecurityPolicy) -> bool {
    validate(pattern, policy).is_ok()
}

/// Validate then compile `pattern`, refusing anything unsafe or slow to build.
pub fn secure_compile(pattern: &str, policy: &SecurityPolicy) -> Result<SafeMatcher, PatternError> {
    validate(pattern, policy).map_err(|reason| PatternError::Unsafe { reason })?;

    let started = Instant::now();
    let regex = RegexBuilder::new(pattern)
        .size_limit(COMPILED_SIZE_LIMIT)
        .build()?;
    let elapsed = started.elapsed();

    if policy.timeout_protection_enabled && elapsed > policy.compile_timeout {
        return Err(PatternError::Timeout {
            elapsed,
            limit: policy.compile_timeout,
        });
    }

    debug!(length = pattern.len(), ?elapsed, "compiled pattern");

    Ok(SafeMatcher {
        regex,
        execute_timeout: policy
            .timeout_protection_enabled
            .then_some(policy.execute_timeout),
    })
}

/// A compiled pattern whose match calls are time-bounded.
///
/// A call that overruns the execution limit is abandoned, logged and
/// answered as "no match"; it never surfaces as an error.
#[derive(Debug, Clone)]
pub struct SafeMatcher {
    regex: Regex,
    execute_timeout: Option<Duration>,
}

impl SafeMatcher {
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub fn is_match(&self, text: &str) -> bool {
        let Some(limit) = self.execute_timeout else {
            return self.regex.is_match(text);
        };

        let started = Instant::now();
        let matched = self.regex.is_match(text);
        if started.elapsed() > limit {
            self.report_overrun(text.len(), started.elapsed());
            return false;
        }
        matched
    }

    /// Byte ranges of all non-overlapping, non-empty matches in `text`.
    pub fn find_ranges(&self, text: &str) -> Vec<Range<usize>> {
        let started = Instant::now();
        let mut ranges = Vec::new();

        for m in self.regex.find_iter(text) {
            if let Some(limit) = self.execute_timeout {
                if started.elapsed() > limit {
                    self.report_overrun(text.len(), started.elapsed());
                    return Vec::new();
                }
            }
            if !m.range().is_empty() {
                ranges.push(m.range());
            }
        }

        ranges
    }

    fn report_overrun(&self, input_len: usize, elapsed: Duration) {
        warn!(
            pattern_len = self.regex.as_str().len(),
            input_len,
            ?elapsed,
            "pattern match exceeded execution limit; treating as no match"
        );
    }
}

/// Structural facts gathered from one pass over a pattern.
#[derive(Debug, Default)]
struct Analysis {
    max_nesting: usize,
    max_branches: usize,
    dangerous: Option<&'static str>,
    too_deep: bool,
}

/// One alternative inside a group.
#[derive(Debug, Default)]
struct Branch {
    text: String,
    atoms: usize,
    repeated_atoms: usize,
}

impl Branch {
    fn is_single_repeated_atom(&self) -> bool {
        self.atoms == 1 && self.repeated_atoms == 1
    }
}

#[derive(Debug, Default)]
struct Group {
    depth: usize,
    branches: Vec<Branch>,
}

impl Group {
    fn text(&self) -> String {
        self.branches
            .iter()
            .map(|b| b.text.as_str())
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Shape that makes a repeated group backtrack exponentially.
    fn catastrophic_shape(&self) -> Option<&'static str> {
        let mut seen = std::collections::HashSet::new();
        for branch in &self.branches {
            if branch.text.is_empty() || !seen.insert(branch.text.as_str()) {
                return Some("overlapping alternation inside a repeated group");
            }
        }

        if self.branches.iter().all(Branch::is_single_repeated_atom) {
            return Some("repeated group wraps a repeated atom (nested quantifier)");
        }

        None
    }
}

/// Groups open at once before the scan gives up. Matches the nesting limit
/// of the `regex` parser and bounds the scanner's recursion.
const MAX_GROUP_DEPTH: usize = 250;

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    open_groups: usize,
    analysis: Analysis,
}

impl Analysis {
    fn of(pattern: &str) -> Analysis {
        let mut scanner = Scanner {
            chars: pattern.chars().collect(),
            pos: 0,
            open_groups: 0,
            analysis: Analysis::default(),
        };
        let top = scanner.sequence(false);
        let mut analysis = scanner.analysis;
        analysis.max_nesting = analysis.max_nesting.max(top.depth);
        analysis.max_branches = analysis.max_branches.max(top.branches.len());
        analysis
    }
}

impl Scanner {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    /// Parse alternatives until a closing paren (left unconsumed) or the end.
    fn sequence(&mut self, nested: bool) -> Group {
        let mut group = Group::default();
        let mut branch = Branch::default();

        while let Some(c) = self.peek() {
            match c {
                ')' if nested => break,
                '|' => {
                    self.pos += 1;
                    group.branches.push(std::mem::take(&mut branch));
                    continue;
                }
                _ => {}
            }

            let (atom_text, atom_depth, inner) = match self.atom() {
                Some(atom) => atom,
                None => continue,
            };
            let (quant_text, repeating) = self.quantifier();

            let depth = if repeating { atom_depth + 1 } else { atom_depth };
            group.depth = group.depth.max(depth);

            if repeating && self.analysis.dangerous.is_none() {
                if let Some(inner) = &inner {
                    self.analysis.dangerous = inner.catastrophic_shape();
                }
            }

            branch.text.push_str(&atom_text);
            branch.text.push_str(&quant_text);
            branch.atoms += 1;
            if repeating {
                branch.repeated_atoms += 1;
            }
        }

        group.branches.push(branch);
        self.analysis.max_branches = self.analysis.max_branches.max(group.branches.len());
        group
    }

    /// Consume one atom. Returns its text, quantifier depth and, for groups,
    /// the parsed body. Flag-only groups such as `(?i)` yield `None`.
    fn atom(&mut self) -> Option<(String, usize, Option<Group>)> {
        let c = self.bump()?;
        match c {
            '\\' => {
                let mut text = String::from('\\');
                if let Some(next) = self.bump() {
                    text.push(next);
                    if matches!(next, 'p' | 'P' | 'x' | 'u' | 'U') && self.peek() == Some('{') {
                        while let Some(b) = self.bump() {
                            text.push(b);
                            if b == '}' {
                                break;
                            }
                        }
                    }
                }
                Some((text, 0, None))
            }
            '[' => Some((self.class(), 0, None)),
            '(' => self.group(),
            // A stray close paren at top level: the compiler reports it.
            ')' => Some((")".to_string(), 0, None)),
            other => Some((other.to_string(), 0, None)),
        }
    }

    fn group(&mut self) -> Option<(String, usize, Option<Group>)> {
        if self.peek() == Some('?') {
            self.pos += 1;
            match self.peek() {
                Some('P') | Some('<') => {
                    while let Some(c) = self.bump() {
                        if c == '>' {
                            break;
                        }
                    }
                }
                _ => {
                    while matches!(self.peek(), Some(c) if c.is_ascii_alphabetic() || c == '-') {
                        self.pos += 1;
                    }
                    match self.peek() {
                        Some(':') => self.pos += 1,
                        Some(')') => {
                            self.pos += 1;
                            return None;
                        }
                        _ => {}
                    }
                }
            }
        }

        if self.open_groups >= MAX_GROUP_DEPTH {
            self.analysis.too_deep = true;
            self.pos = self.chars.len();
            return None;
        }

        self.open_groups += 1;
        let inner = self.sequence(true);
        self.open_groups -= 1;
        // Unbalanced groups are left for the compiler to reject.
        if self.peek() == Some(')') {
            self.pos += 1;
        }

        let text = format!("({})", inner.text());
        let depth = inner.depth;
        Some((text, depth, Some(inner)))
    }

    /// Consume a bracketed class, including nested classes and escapes.
    fn class(&mut self) -> String {
        let mut text = String::from('[');
        let mut depth = 1usize;

        if self.peek() == Some('^') {
            text.push('^');
            self.pos += 1;
        }
        if self.peek() == Some(']') {
            text.push(']');
            self.pos += 1;
        }

        while let Some(c) = self.bump() {
            text.push(c);
            match c {
                '\\' => {
                    if let Some(next) = self.bump() {
                        text.push(next);
                    }
                }
                '[' => depth += 1,
                ']' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
        }

        text
    }

    /// Consume an optional quantifier. Returns its text and whether it lets
    /// the preceding atom match more than once.
    fn quantifier(&mut self) -> (String, bool) {
        let (mut text, repeating) = match self.peek() {
            Some(c @ ('*' | '+')) => {
                self.pos += 1;
                (c.to_string(), true)
            }
            Some('?') => {
                self.pos += 1;
                ("?".to_string(), false)
            }
            Some('{') => match self.counted_repetition() {
                Some(result) => result,
                None => return (String::new(), false),
            },
            _ => return (String::new(), false),
        };

        // Lazy modifier.
        if self.peek() == Some('?') {
            self.pos += 1;
            text.push('?');
        }

        (text, repeating)
    }

    /// Parse `{m}`, `{m,}` or `{m,n}`. Anything else leaves `{` as a literal.
    fn counted_repetition(&mut self) -> Option<(String, bool)> {
        let rest: String = self.chars[self.pos..].iter().take(32).collect();
        let close = rest.find('}')?;
        let body = &rest[1..close];

        let (min, max) = match body.split_once(',') {
            Some((min, max)) => (min.trim(), Some(max.trim())),
            None => (body.trim(), None),
        };
        let min: usize = min.parse().ok()?;
        let repeating = match max {
            None => min > 1,
            Some("") => true,
            Some(max) => max.parse::<usize>().ok()? > 1,
        };

        let text = rest[..=close].to_string();
        self.pos += text.chars().count();
        Some((text, repeating))
    }
}
