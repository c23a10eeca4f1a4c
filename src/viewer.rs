use crate::config::Config;
use crate::error::SourceError;
use crate::exclusions::ExclusionEngine;
use crate::highlighter::{Highlighter, ViewerStats};
use crate::pipeline::{LogPipeline, StyledLogLine};
use crate::source::{FileInfo, LineSource, SourceDescriptor};
use crate::styling::StylingEngine;
use crate::watcher::{ChangeWatcher, WatchEvent};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Drives one source: initial read, then optional follow mode.
#[derive(Debug)]
pub struct Viewer {
    config: Config,
    highlighter: Highlighter,
    stats: ViewerStats,
}

/// Result of a read performed off the async runtime.
struct Refresh {
    lines: Vec<StyledLogLine>,
    rotated: bool,
}

impl Viewer {
    pub fn new(config: Config) -> Self {
        let highlighter = Highlighter::new(config.clone());
        Self {
            config,
            highlighter,
            stats: ViewerStats::default(),
        }
    }

    pub fn stats(&self) -> &ViewerStats {
        &self.stats
    }

    /// Build the pipeline described by the configuration. Remote URLs are
    /// fully validated here; nothing is opened yet.
    pub fn build_pipeline(config: &Config) -> Result<LogPipeline> {
        let descriptor = SourceDescriptor::parse(&config.source)?;
        let source = LineSource::new(descriptor, &config.source_options);

        let mut exclusions = ExclusionEngine::new(config.security.clone());
        for rule in &config.exclusions {
            exclusions.add(&rule.text, rule.is_regex);
        }

        let styling = StylingEngine::with_cache_capacity(
            &config.styling,
            config.security.clone(),
            config.cache_size,
        );

        Ok(LogPipeline::new(source, exclusions, styling))
    }

    pub async fn run(&mut self) -> Result<()> {
        let pipeline = Self::build_pipeline(&self.config)?;
        let name = pipeline.source().display_name();
        let watcher = Arc::new(ChangeWatcher::new());

        let follow = self.config.follow;
        let baseline = Arc::clone(&watcher);
        let (mut pipeline, opened) = blocking(pipeline, move |pipeline| {
            pipeline.open()?;
            if follow {
                baseline.check_for_changes(&pipeline.watch_target()?)?;
            }
            let lines = pipeline.load()?;
            let info = pipeline.file_info()?;
            Ok((lines, info))
        })
        .await?;
        let (lines, info): (Vec<StyledLogLine>, FileInfo) =
            opened.with_context(|| format!("Failed to read {}", name))?;

        self.highlighter.print_startup_info(&info)?;
        self.print_lines(&lines)?;
        self.update_stats(&pipeline);

        if follow {
            pipeline = self.follow(pipeline, watcher, &name).await?;
        }

        let (_closed, _) = blocking(pipeline, |pipeline| {
            pipeline.close();
            Ok(())
        })
        .await?;

        self.highlighter.print_shutdown_summary(&self.stats)?;
        Ok(())
    }

    async fn follow(
        &mut self,
        mut pipeline: LogPipeline,
        watcher: Arc<ChangeWatcher>,
        name: &str,
    ) -> Result<LogPipeline> {
        info!(source = %name, "following source");

        let target = pipeline.watch_target()?;
        let (tx, mut rx) = mpsc::channel::<WatchEvent>(16);
        let interval = Duration::from_millis(self.config.poll_interval.max(1));
        let handle = watcher.spawn(target, interval, tx);

        // Registered once so an interrupt during a refresh is not lost.
        let interrupt = tokio::signal::ctrl_c();
        tokio::pin!(interrupt);

        let mut last_error: Option<String> = None;
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(WatchEvent::Changed { .. }) => {
                        last_error = None;
                        let after = pipeline.last_line_number();
                        let (returned, refreshed) =
                            blocking(pipeline, move |pipeline| refresh(pipeline, after)).await?;
                        pipeline = returned;

                        match refreshed {
                            Ok(refresh) => {
                                if refresh.rotated {
                                    self.stats.reloads += 1;
                                    self.highlighter.print_rotation(name)?;
                                }
                                self.print_lines(&refresh.lines)?;
                                self.update_stats(&pipeline);
                            }
                            Err(e) => self.highlighter.print_source_error(name, &e.to_string())?,
                        }
                    }
                    Some(WatchEvent::Error { message, .. }) => {
                        if last_error.as_deref() != Some(message.as_str()) {
                            warn!(source = %name, "{}", message);
                            self.highlighter.print_source_error(name, &message)?;
                            last_error = Some(message);
                        }
                    }
                    None => break,
                },
                _ = &mut interrupt => {
                    debug!("interrupted");
                    break;
                }
            }
        }

        drop(rx);
        handle.abort();
        Ok(pipeline)
    }

    fn print_lines(&mut self, lines: &[StyledLogLine]) -> Result<()> {
        for line in lines {
            self.highlighter
                .print_line(line.line.line_number(), &line.styled)?;
        }
        self.stats.lines_shown += lines.len();
        Ok(())
    }

    fn update_stats(&mut self, pipeline: &LogPipeline) {
        self.stats.lines_read = pipeline.lines_read();
        self.stats.lines_excluded = pipeline.excluded_count();
    }
}

/// Re-read after a change. A source that now has fewer lines than were
/// already shown was truncated or replaced and is read again from the top.
fn refresh(pipeline: &mut LogPipeline, after: usize) -> Result<Refresh, SourceError> {
    pipeline.reopen()?;
    let total = pipeline.file_info()?.total_lines;
    let rotated = total < after;
    let after = if rotated { 0 } else { after };
    let lines = pipeline.load_since(after)?;
    Ok(Refresh { lines, rotated })
}

/// Run blocking pipeline work on the blocking pool, handing the pipeline
/// back together with the outcome.
async fn blocking<T, F>(
    mut pipeline: LogPipeline,
    work: F,
) -> Result<(LogPipeline, Result<T, SourceError>)>
where
    T: Send + 'static,
    F: FnOnce(&mut LogPipeline) -> Result<T, SourceError> + Send + 'static,
{
    let joined = tokio::task::spawn_blocking(move || {
        let outcome = work(&mut pipeline);
        (pipeline, outcome)
    })
    .await
    .context("Source task failed")?;
    Ok(joined)
}
