//! Source, exclusions and styling wired together.

use crate::error::SourceError;
use crate::exclusions::ExclusionEngine;
use crate::source::{FileInfo, LineSource, LogLine};
use crate::styling::{StyledLine, StylingEngine};
use crate::watcher::WatchTarget;
use std::sync::Arc;

/// A kept line and its decoration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyledLogLine {
    pub line: LogLine,
    pub styled: Arc<StyledLine>,
}

#[derive(Debug)]
pub struct LogPipeline {
    source: LineSource,
    exclusions: ExclusionEngine,
    styling: StylingEngine,
    last_line_number: usize,
    lines_read: usize,
}

impl LogPipeline {
    pub fn new(source: LineSource, exclusions: ExclusionEngine, styling: StylingEngine) -> Self {
        Self {
            source,
            exclusions,
            styling,
            last_line_number: 0,
            lines_read: 0,
        }
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        if self.source.is_open() {
            return Ok(());
        }
        self.source.open()
    }

    /// Read the source as it is now, honouring the tail setting, then drop
    /// excluded lines and style the rest.
    pub fn load(&mut self) -> Result<Vec<StyledLogLine>, SourceError> {
        self.open()?;
        let lines = self.source.read_lines()?.collect::<Result<Vec<_>, _>>()?;
        // `--tail 0` shows nothing but still starts following at the end.
        let floor = match (lines.is_empty(), self.source.tail()) {
            (true, Some(_)) => self.source.file_info()?.total_lines,
            _ => 0,
        };
        Ok(self.process(lines, floor))
    }

    /// Every line numbered above `after`, however many arrived since the
    /// last load. The tail setting only shapes the first view.
    pub fn load_since(&mut self, after: usize) -> Result<Vec<StyledLogLine>, SourceError> {
        self.open()?;
        let lines = self
            .source
            .read_lines_after(after)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.process(lines, after))
    }

    fn process(&mut self, lines: Vec<LogLine>, after: usize) -> Vec<StyledLogLine> {
        self.lines_read += lines.len();
        self.last_line_number = lines.last().map_or(after, LogLine::line_number);

        self.exclusions
            .filter(lines)
            .into_iter()
            .map(|line| {
                let styled = self.styling.apply_styling_cached(line.content());
                StyledLogLine { line, styled }
            })
            .collect()
    }

    /// Local sources get a fresh handle so a replaced file is picked up.
    /// An open remote session is kept.
    pub fn reopen(&mut self) -> Result<(), SourceError> {
        if matches!(self.source, LineSource::Local(_)) {
            self.source.close();
        }
        self.open()
    }

    /// Highest line number seen by the latest load.
    pub fn last_line_number(&self) -> usize {
        self.last_line_number
    }

    /// New lines read across all loads, before exclusion.
    pub fn lines_read(&self) -> usize {
        self.lines_read
    }

    pub fn file_info(&mut self) -> Result<FileInfo, SourceError> {
        self.source.file_info()
    }

    pub fn watch_target(&self) -> Result<WatchTarget, SourceError> {
        self.source.watch_target()
    }

    pub fn excluded_count(&self) -> usize {
        self.exclusions.excluded_count()
    }

    pub fn source(&self) -> &LineSource {
        &self.source
    }

    pub fn exclusions(&self) -> &ExclusionEngine {
        &self.exclusions
    }

    pub fn exclusions_mut(&mut self) -> &mut ExclusionEngine {
        &mut self.exclusions
    }

    pub fn styling(&self) -> &StylingEngine {
        &self.styling
    }

    pub fn styling_mut(&mut self) -> &mut StylingEngine {
        &mut self.styling
    }

    pub fn close(&mut self) {
        self.source.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::SecurityPolicy;
    use crate::source::{LocalSource, SourceOptions};
    use crate::styling::{NamedPattern, Style, StylingConfig};
    use std::io::Write;
    use tempfile::NamedTempFile;
    use termcolor::Color;

    fn log_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in [
            "2024-01-15 10:00:00 INFO service started",
            "2024-01-15 10:00:01 DEBUG cache warm",
            "",
            "2024-01-15 10:00:02 ERROR upstream timeout",
            "2024-01-15 10:00:03 DEBUG retrying",
        ] {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn pipeline(file: &NamedTempFile, tail: Option<usize>) -> LogPipeline {
        let policy = SecurityPolicy::default();
        let source = LineSource::Local(LocalSource::new(file.path(), tail));
        let exclusions = ExclusionEngine::with_patterns(policy.clone(), ["DEBUG"], false);
        let styling = StylingEngine::new(
            &StylingConfig {
                patterns: vec![NamedPattern::new("error", r"\bERROR\b", Style::fg(Color::Red))],
                ..StylingConfig::default()
            },
            policy,
        );
        LogPipeline::new(source, exclusions, styling)
    }

    #[test]
    fn test_load_filters_and_styles() {
        let file = log_file();
        let mut pipeline = pipeline(&file, None);

        let lines = pipeline.load().unwrap();
        let numbers: Vec<usize> = lines.iter().map(|l| l.line.line_number()).collect();
        assert_eq!(numbers, vec![1, 3, 4]);
        assert_eq!(pipeline.excluded_count(), 2);
        assert_eq!(pipeline.last_line_number(), 5);
        assert_eq!(pipeline.lines_read(), 5);

        let error = &lines[2];
        assert_eq!(error.styled.text, error.line.content());
        assert_eq!(error.styled.spans.len(), 1);
        assert!(lines[0].styled.spans.is_empty());
    }

    #[test]
    fn test_load_since_returns_only_new_lines() {
        let mut file = log_file();
        let mut pipeline = pipeline(&file, None);
        pipeline.load().unwrap();

        writeln!(file, "2024-01-15 10:00:04 WARN slow response").unwrap();
        file.flush().unwrap();

        let fresh = pipeline.load_since(5).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].line.line_number(), 6);
        assert_eq!(pipeline.last_line_number(), 6);
        assert_eq!(pipeline.lines_read(), 6);

        assert!(pipeline.load_since(6).unwrap().is_empty());
        assert_eq!(pipeline.last_line_number(), 6);
        assert_eq!(pipeline.file_info().unwrap().total_lines, 6);
    }

    #[test]
    fn test_follow_after_tail_keeps_every_appended_line() {
        let mut file = log_file();
        let mut pipeline = pipeline(&file, Some(2));
        pipeline.load().unwrap();
        assert_eq!(pipeline.last_line_number(), 5);

        for i in 6..=10 {
            writeln!(file, "2024-01-15 10:00:{i:02} INFO request {i}").unwrap();
        }
        file.flush().unwrap();

        pipeline.reopen().unwrap();
        let fresh = pipeline.load_since(5).unwrap();
        let numbers: Vec<usize> = fresh.iter().map(|l| l.line.line_number()).collect();
        assert_eq!(numbers, vec![6, 7, 8, 9, 10]);
        assert_eq!(pipeline.last_line_number(), 10);
    }

    #[test]
    fn test_tail_zero_starts_at_end() {
        let mut file = log_file();
        let mut pipeline = pipeline(&file, Some(0));
        assert!(pipeline.load().unwrap().is_empty());
        assert_eq!(pipeline.last_line_number(), 5);

        writeln!(file, "2024-01-15 10:00:06 INFO next").unwrap();
        file.flush().unwrap();
        let fresh = pipeline.load_since(pipeline.last_line_number()).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].line.line_number(), 6);
    }

    #[test]
    fn test_tail_then_reopen() {
        let file = log_file();
        let mut pipeline = pipeline(&file, Some(2));
        let lines = pipeline.load().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line.line_number(), 4);

        pipeline.reopen().unwrap();
        assert!(pipeline.source().is_open());
        pipeline.close();
        assert!(!pipeline.source().is_open());
    }

    #[test]
    fn test_from_identifier_missing_file() {
        let source =
            LineSource::from_identifier("/non/existent/file.log", &SourceOptions::default()).unwrap();
        let mut pipeline = LogPipeline::new(
            source,
            ExclusionEngine::default(),
            StylingEngine::new(&StylingConfig::default(), SecurityPolicy::default()),
        );
        assert!(matches!(pipeline.load(), Err(SourceError::NotFound { .. })));
    }
}
