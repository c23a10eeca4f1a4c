//! Line sources: local files and files reachable over SSH.
//!
//! A source is opened, read as a lazy sequence of [`LogLine`] values and
//! closed. Every read is a point-in-time snapshot of the file as it was when
//! the read started; growth is picked up by the change watcher and a re-read.

pub mod local;
pub mod path;
pub mod remote;
pub mod ssh;
pub mod url;

use crate::error::SourceError;
use crate::watcher::{WatchSnapshot, WatchTarget};
use std::fmt;
use std::io::BufRead;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

pub use local::LocalSource;
pub use path::PathPolicy;
pub use remote::{RemoteSession, RemoteSource};
pub use url::{is_ssh_url, SshUrl};

/// Lazy sequence of lines produced by a single read.
pub type Lines<'a> = Box<dyn Iterator<Item = Result<LogLine, SourceError>> + Send + 'a>;

/// One line of a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    line_number: usize,
    content: String,
    original_content: String,
}

impl LogLine {
    pub fn new(line_number: usize, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            line_number,
            original_content: content.clone(),
            content,
        }
    }

    /// A line whose displayed content differs from what was read.
    pub fn with_original(
        line_number: usize,
        content: impl Into<String>,
        original_content: impl Into<String>,
    ) -> Self {
        Self {
            line_number,
            content: content.into(),
            original_content: original_content.into(),
        }
    }

    pub fn line_number(&self) -> usize {
        self.line_number
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn original_content(&self) -> &str {
        &self.original_content
    }
}

impl AsRef<str> for LogLine {
    fn as_ref(&self) -> &str {
        &self.content
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub path: String,
    pub size: u64,
    pub total_lines: usize,
    pub modified: Option<SystemTime>,
}

/// Where lines come from, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDescriptor {
    Local { path: PathBuf },
    Remote(SshUrl),
}

impl SourceDescriptor {
    /// Classify and validate a source identifier. Remote URLs are fully
    /// validated here, before anything touches the network.
    pub fn parse(identifier: &str) -> Result<Self, SourceError> {
        if is_ssh_url(identifier) {
            Ok(SourceDescriptor::Remote(SshUrl::parse(identifier)?))
        } else {
            Ok(SourceDescriptor::Local {
                path: PathBuf::from(identifier),
            })
        }
    }
}

/// Connection settings for remote sources.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connection_timeout: Duration,
    /// known_hosts files consulted for host key verification, in order.
    pub known_hosts_files: Vec<PathBuf>,
    /// Private keys tried after the SSH agent.
    pub identity_files: Vec<PathBuf>,
    pub use_agent: bool,
}

impl Default for SshOptions {
    fn default() -> Self {
        let ssh_dir = dirs::home_dir().map(|home| home.join(".ssh"));

        let mut known_hosts_files = vec![PathBuf::from("/etc/ssh/ssh_known_hosts")];
        let mut identity_files = Vec::new();
        if let Some(dir) = ssh_dir {
            known_hosts_files.push(dir.join("known_hosts"));
            for name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
                identity_files.push(dir.join(name));
            }
        }

        Self {
            connection_timeout: Duration::from_secs(30),
            known_hosts_files,
            identity_files,
            use_agent: true,
        }
    }
}

/// Settings shared by every kind of source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub tail: Option<usize>,
    pub buffer_size: usize,
    pub path_policy: PathPolicy,
    pub ssh: SshOptions,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            tail: None,
            buffer_size: 8192,
            path_policy: PathPolicy::default(),
            ssh: SshOptions::default(),
        }
    }
}

/// A local or remote source behind one contract.
#[derive(Debug)]
pub enum LineSource {
    Local(LocalSource),
    Remote(RemoteSource),
}

impl LineSource {
    pub fn new(descriptor: SourceDescriptor, options: &SourceOptions) -> Self {
        match descriptor {
            SourceDescriptor::Local { path } => LineSource::Local(LocalSource::with_options(
                path,
                options.tail,
                options.buffer_size,
                options.path_policy.clone(),
            )),
            SourceDescriptor::Remote(url) => LineSource::Remote(RemoteSource::new(
                url,
                options.tail,
                options.buffer_size,
                options.ssh.clone(),
            )),
        }
    }

    pub fn from_identifier(identifier: &str, options: &SourceOptions) -> Result<Self, SourceError> {
        Ok(Self::new(SourceDescriptor::parse(identifier)?, options))
    }

    pub fn open(&mut self) -> Result<(), SourceError> {
        match self {
            LineSource::Local(source) => source.open(),
            LineSource::Remote(source) => source.open(),
        }
    }

    pub fn read_lines(&mut self) -> Result<Lines<'_>, SourceError> {
        match self {
            LineSource::Local(source) => Ok(Box::new(source.read_lines()?)),
            LineSource::Remote(source) => source.read_lines(),
        }
    }

    /// Every line numbered above `after`, regardless of the tail setting.
    /// Used to catch up after the first read.
    pub fn read_lines_after(&mut self, after: usize) -> Result<Lines<'_>, SourceError> {
        match self {
            LineSource::Local(source) => Ok(Box::new(source.read_lines_after(after)?)),
            LineSource::Remote(source) => source.read_lines_after(after),
        }
    }

    pub fn file_info(&mut self) -> Result<FileInfo, SourceError> {
        match self {
            LineSource::Local(source) => source.file_info(),
            LineSource::Remote(source) => source.file_info(),
        }
    }

    pub fn close(&mut self) {
        match self {
            LineSource::Local(source) => source.close(),
            LineSource::Remote(source) => source.close(),
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            LineSource::Local(source) => source.is_open(),
            LineSource::Remote(source) => source.is_open(),
        }
    }

    pub fn tail(&self) -> Option<usize> {
        match self {
            LineSource::Local(source) => source.tail(),
            LineSource::Remote(source) => source.tail(),
        }
    }

    /// Handle the change watcher polls. Remote sources must be open.
    pub fn watch_target(&self) -> Result<WatchTarget, SourceError> {
        match self {
            LineSource::Local(source) => Ok(WatchTarget::Local(source.path().to_path_buf())),
            LineSource::Remote(source) => source.watch_target(),
        }
    }

    pub fn snapshot(&self) -> Result<WatchSnapshot, SourceError> {
        self.watch_target()?.snapshot()
    }

    /// Short name suitable for status lines.
    pub fn display_name(&self) -> String {
        match self {
            LineSource::Local(source) => source.path().display().to_string(),
            LineSource::Remote(source) => source.url().to_string(),
        }
    }
}

/// Strip the line terminator and decode, replacing invalid UTF-8.
pub(crate) fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Numbered lines pulled from any buffered reader.
pub(crate) struct ReaderLines<R> {
    reader: R,
    name: String,
    next_number: usize,
    buf: Vec<u8>,
    done: bool,
}

impl<R: BufRead> ReaderLines<R> {
    pub(crate) fn new(reader: R, name: impl Into<String>, first_number: usize) -> Self {
        Self {
            reader,
            name: name.into(),
            next_number: first_number,
            buf: Vec::new(),
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for ReaderLines<R> {
    type Item = Result<LogLine, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                let line = LogLine::new(self.next_number, decode_line(&self.buf));
                self.next_number += 1;
                Some(Ok(line))
            }
            Err(source) => {
                self.done = true;
                Some(Err(SourceError::Io {
                    name: self.name.clone(),
                    source,
                }))
            }
        }
    }
}
