use crate::config::Config;
use crate::source::FileInfo;
use crate::styling::StyledLine;
use crate::utils::format_file_size;
use anyhow::Result;
use std::io::Write;
use termcolor::{Color, ColorChoice, ColorSpec, StandardStream, WriteColor};

const LINE_NUMBER_WIDTH: usize = 6;

#[derive(Debug)]
pub struct Highlighter {
    config: Config,
    stdout: StandardStream,
    stderr: StandardStream,
}

impl Highlighter {
    pub fn new(config: Config) -> Self {
        let color_choice = if config.no_color {
            ColorChoice::Never
        } else {
            ColorChoice::Auto
        };

        Self {
            config,
            stdout: StandardStream::stdout(color_choice),
            stderr: StandardStream::stderr(color_choice),
        }
    }

    pub fn print_line(&mut self, line_number: usize, styled: &StyledLine) -> Result<()> {
        let number = self.config.show_line_numbers.then_some(line_number);
        write_styled(&mut self.stdout, number, styled)?;
        self.stdout.flush()?;
        Ok(())
    }

    fn print_plain(&mut self, text: &str) -> Result<()> {
        writeln!(self.stderr, "{}", text)?;
        self.stderr.flush()?;
        Ok(())
    }

    fn print_tagged(&mut self, tag: &str, color: Color, message: &str) -> Result<()> {
        self.stderr.set_color(ColorSpec::new().set_fg(Some(color)))?;
        writeln!(self.stderr, "{}: {}", tag, message)?;
        self.stderr.reset()?;
        self.stderr.flush()?;
        Ok(())
    }

    pub fn print_error(&mut self, message: &str) -> Result<()> {
        self.print_tagged("Error", Color::Red, message)
    }

    pub fn print_warning(&mut self, message: &str) -> Result<()> {
        self.print_tagged("Warning", Color::Yellow, message)
    }

    pub fn print_info(&mut self, message: &str) -> Result<()> {
        self.print_tagged("Info", Color::Cyan, message)
    }

    pub fn print_startup_info(&mut self, info: &FileInfo) -> Result<()> {
        self.print_info(&format!(
            "Reading {} ({}, {} lines)",
            info.path,
            format_file_size(info.size),
            info.total_lines
        ))?;

        if let Some(tail) = self.config.source_options.tail {
            self.print_info(&format!("Showing the last {} lines", tail))?;
        }

        if !self.config.exclusions.is_empty() {
            let listed: Vec<String> = self
                .config
                .exclusions
                .iter()
                .map(|rule| {
                    if rule.is_regex {
                        format!("/{}/", rule.text)
                    } else {
                        rule.text.clone()
                    }
                })
                .collect();
            self.print_info(&format!(
                "Excluding {} pattern(s): {}",
                listed.len(),
                listed.join(", ")
            ))?;
        }

        if self.config.follow {
            self.print_info("Following changes, press Ctrl+C to stop")?;
        }

        Ok(())
    }

    pub fn print_rotation(&mut self, source: &str) -> Result<()> {
        self.print_warning(&format!("{} was truncated or rotated, reloading", source))
    }

    pub fn print_source_error(&mut self, source: &str, error: &str) -> Result<()> {
        self.print_error(&format!("Error reading {}: {}", source, error))
    }

    pub fn print_shutdown_summary(&mut self, stats: &ViewerStats) -> Result<()> {
        self.print_info("Summary:")?;
        self.print_plain(&format!("  Lines read: {}", stats.lines_read))?;
        self.print_plain(&format!("  Lines shown: {}", stats.lines_shown))?;
        self.print_plain(&format!("  Lines excluded: {}", stats.lines_excluded))?;
        if stats.reloads > 0 {
            self.print_plain(&format!("  Reloads: {}", stats.reloads))?;
        }
        Ok(())
    }
}

/// Write one styled line, optionally prefixed with its number.
pub fn write_styled<W: WriteColor>(
    out: &mut W,
    line_number: Option<usize>,
    styled: &StyledLine,
) -> std::io::Result<()> {
    if let Some(number) = line_number {
        out.set_color(ColorSpec::new().set_dimmed(true))?;
        write!(out, "{:>width$} ", number, width = LINE_NUMBER_WIDTH)?;
        out.reset()?;
    }

    for (text, style) in styled.segments() {
        match style {
            Some(style) => {
                out.set_color(&style.color_spec())?;
                write!(out, "{}", text)?;
                out.reset()?;
            }
            None => write!(out, "{}", text)?,
        }
    }

    writeln!(out)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ViewerStats {
    pub lines_read: usize,
    pub lines_shown: usize,
    pub lines_excluded: usize,
    pub reloads: usize,
}
