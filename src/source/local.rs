use super::path::{validate_local_path, PathPolicy};
use super::{FileInfo, ReaderLines};
use crate::error::SourceError;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Take};
use std::path::{Path, PathBuf};
use tracing::debug;

const MIN_BUFFER_SIZE: usize = 512;

/// Lines produced by one read of a local file.
pub(crate) type LocalLines<'a> = ReaderLines<BufReader<Take<&'a mut File>>>;

#[derive(Debug)]
pub struct LocalSource {
    path: PathBuf,
    tail: Option<usize>,
    buffer_size: usize,
    policy: PathPolicy,
    file: Option<File>,
    /// Line count and the byte offset where the next line starts, as of the
    /// latest follow read. Kept across reopen.
    checkpoint: Option<(usize, u64)>,
}

impl LocalSource {
    pub fn new(path: impl Into<PathBuf>, tail: Option<usize>) -> Self {
        Self::with_options(path, tail, 8192, PathPolicy::default())
    }

    pub fn with_options(
        path: impl Into<PathBuf>,
        tail: Option<usize>,
        buffer_size: usize,
        policy: PathPolicy,
    ) -> Self {
        Self {
            path: path.into(),
            tail,
            buffer_size: buffer_size.max(MIN_BUFFER_SIZE),
            policy,
            file: None,
            checkpoint: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Validate the path and acquire a handle. Reopening replaces the handle,
    /// which is how a rotated file is picked up.
    pub fn open(&mut self) -> Result<(), SourceError> {
        let path = validate_local_path(&self.path, &self.policy)?;
        let file = File::open(&path).map_err(|e| SourceError::from_io(self.name(), e))?;
        debug!(path = %self.path.display(), "opened local source");
        self.file = Some(file);
        Ok(())
    }

    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!(path = %self.path.display(), "closed local source");
        }
    }

    /// Read the file as it is now. Data appended after this call returns is
    /// not part of the sequence.
    pub(crate) fn read_lines(&mut self) -> Result<LocalLines<'_>, SourceError> {
        let name = self.name();
        let block = self.buffer_size;
        let tail = self.tail;
        let file = self.file.as_mut().ok_or(SourceError::NotOpen)?;
        let io_err = |e| SourceError::Io {
            name: name.clone(),
            source: e,
        };

        let len = file.metadata().map_err(io_err)?.len();

        let (offset, first_number) = match tail {
            None => (0, 1),
            Some(0) => (len, 1),
            Some(n) => {
                let offset = tail_offset(file, len, n, block).map_err(io_err)?;
                file.seek(SeekFrom::Start(0)).map_err(io_err)?;
                let (preceding, _) =
                    count_newlines((&mut *file).take(offset), block).map_err(io_err)?;
                (offset, preceding as usize + 1)
            }
        };

        file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        let reader = BufReader::with_capacity(block, file.take(len - offset));
        Ok(ReaderLines::new(reader, name, first_number))
    }

    /// Read every line numbered above `after`, ignoring the tail setting.
    /// Scanning resumes from the last checkpoint when it is still in range.
    pub(crate) fn read_lines_after(&mut self, after: usize) -> Result<LocalLines<'_>, SourceError> {
        let name = self.name();
        let block = self.buffer_size;
        let file = self.file.as_mut().ok_or(SourceError::NotOpen)?;
        let io_err = |e| SourceError::Io {
            name: name.clone(),
            source: e,
        };

        let len = file.metadata().map_err(io_err)?.len();
        let (skipped, offset) = self
            .checkpoint
            .filter(|&(line, offset)| line <= after && offset <= len)
            .unwrap_or((0, 0));

        file.seek(SeekFrom::Start(offset)).map_err(io_err)?;
        let start = match skip_lines((&mut *file).take(len - offset), after - skipped, block)
            .map_err(io_err)?
        {
            Some(bytes) => {
                self.checkpoint = Some((after, offset + bytes));
                offset + bytes
            }
            // Line `after` is still unterminated: nothing new yet.
            None => len,
        };

        file.seek(SeekFrom::Start(start)).map_err(io_err)?;
        let reader = BufReader::with_capacity(block, file.take(len - start));
        Ok(ReaderLines::new(reader, name, after + 1))
    }

    pub fn file_info(&mut self) -> Result<FileInfo, SourceError> {
        let name = self.name();
        let block = self.buffer_size;
        let file = self.file.as_mut().ok_or(SourceError::NotOpen)?;
        let io_err = |e| SourceError::Io {
            name: name.clone(),
            source: e,
        };

        let metadata = file.metadata().map_err(io_err)?;
        let size = metadata.len();
        file.seek(SeekFrom::Start(0)).map_err(io_err)?;
        let (newlines, last) = count_newlines((&mut *file).take(size), block).map_err(io_err)?;

        let unterminated = matches!(last, Some(b) if b != b'\n');
        Ok(FileInfo {
            path: self.path.display().to_string(),
            size,
            total_lines: newlines as usize + usize::from(unterminated),
            modified: metadata.modified().ok(),
        })
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Byte offset where the last `n` lines of the first `len` bytes begin.
fn tail_offset(file: &mut File, len: u64, n: usize, block: usize) -> io::Result<u64> {
    let mut end = len;
    if end > 0 {
        let mut last = [0u8; 1];
        file.seek(SeekFrom::Start(end - 1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            end -= 1;
        }
    }

    let mut remaining = n;
    let mut buf = vec![0u8; block];
    while end > 0 {
        let start = end.saturating_sub(block as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;

        for (i, &byte) in chunk.iter().enumerate().rev() {
            if byte == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(start + i as u64 + 1);
                }
            }
        }
        end = start;
    }

    Ok(0)
}

/// Bytes spanned by the first `count` terminated lines, or `None` when the
/// reader holds fewer.
fn skip_lines<R: Read>(mut reader: R, count: usize, block: usize) -> io::Result<Option<u64>> {
    if count == 0 {
        return Ok(Some(0));
    }

    let mut buf = vec![0u8; block];
    let mut consumed = 0u64;
    let mut remaining = count;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        for (i, &byte) in buf[..read].iter().enumerate() {
            if byte == b'\n' {
                remaining -= 1;
                if remaining == 0 {
                    return Ok(Some(consumed + i as u64 + 1));
                }
            }
        }
        consumed += read as u64;
    }
}

/// Newline count and the final byte seen.
fn count_newlines<R: Read>(mut reader: R, block: usize) -> io::Result<(u64, Option<u8>)> {
    let mut buf = vec![0u8; block];
    let mut count = 0u64;
    let mut last = None;
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        count += buf[..read].iter().filter(|&&b| b == b'\n').count() as u64;
        last = Some(buf[read - 1]);
    }
    Ok((count, last))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::LogLine;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn five_line_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for i in 1..=5 {
            writeln!(file, "Line {i}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn read_all(source: &mut LocalSource) -> Vec<LogLine> {
        source.read_lines().unwrap().collect::<Result<_, _>>().unwrap()
    }

    #[test]
    fn test_full_read() {
        let file = five_line_file();
        let mut source = LocalSource::new(file.path(), None);
        source.open().unwrap();

        let lines = read_all(&mut source);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0].line_number(), 1);
        assert_eq!(lines[0].content(), "Line 1");
        assert_eq!(lines[4].line_number(), 5);
    }

    #[test]
    fn test_tail_modes() {
        let file = five_line_file();

        let mut source = LocalSource::new(file.path(), Some(2));
        source.open().unwrap();
        let lines = read_all(&mut source);
        let contents: Vec<&str> = lines.iter().map(LogLine::content).collect();
        assert_eq!(contents, vec!["Line 4", "Line 5"]);
        assert_eq!(lines[0].line_number(), 4);
        assert_eq!(lines[1].line_number(), 5);

        let mut source = LocalSource::new(file.path(), Some(0));
        source.open().unwrap();
        assert!(read_all(&mut source).is_empty());

        let mut source = LocalSource::new(file.path(), Some(10));
        source.open().unwrap();
        assert_eq!(read_all(&mut source).len(), 5);
    }

    #[test]
    fn test_tail_spanning_blocks_without_final_newline() {
        let mut file = NamedTempFile::new().unwrap();
        let body: Vec<String> = (1..=300).map(|i| format!("entry number {i:04}")).collect();
        write!(file, "{}", body.join("\n")).unwrap();
        file.flush().unwrap();

        let mut source = LocalSource::with_options(file.path(), Some(100), 512, PathPolicy::default());
        source.open().unwrap();
        let lines = read_all(&mut source);
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[0].line_number(), 201);
        assert_eq!(lines[0].content(), "entry number 0201");
        assert_eq!(lines[99].content(), "entry number 0300");

        let info = source.file_info().unwrap();
        assert_eq!(info.total_lines, 300);
    }

    #[test]
    fn test_reopen_after_close() {
        let file = five_line_file();
        let mut source = LocalSource::new(file.path(), None);

        source.open().unwrap();
        let first = read_all(&mut source);
        source.close();
        assert!(!source.is_open());
        assert!(matches!(source.read_lines(), Err(SourceError::NotOpen)));

        source.open().unwrap();
        assert_eq!(read_all(&mut source), first);
        assert_eq!(read_all(&mut source), first);
    }

    #[test]
    fn test_missing_file() {
        let mut source = LocalSource::new("/non/existent/file.log", None);
        assert!(matches!(source.open(), Err(SourceError::NotFound { .. })));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"ok\n\xff\xfe broken\nend\n").unwrap();
        file.flush().unwrap();

        let mut source = LocalSource::new(file.path(), None);
        source.open().unwrap();
        let lines = read_all(&mut source);
        assert_eq!(lines.len(), 3);
        assert!(lines[1].content().contains('\u{fffd}'));
        assert!(lines[1].content().ends_with(" broken"));
    }

    #[test]
    fn test_append_during_read_is_not_observed() {
        let mut file = five_line_file();
        let mut source = LocalSource::new(file.path(), None);
        source.open().unwrap();

        let mut lines = source.read_lines().unwrap();
        assert_eq!(lines.next().unwrap().unwrap().content(), "Line 1");

        writeln!(file, "Line 6").unwrap();
        file.flush().unwrap();

        let rest: Vec<LogLine> = lines.collect::<Result<_, _>>().unwrap();
        assert_eq!(rest.len(), 4);
        assert_eq!(rest.last().unwrap().content(), "Line 5");

        assert_eq!(read_all(&mut source).len(), 6);
    }

    fn read_after(source: &mut LocalSource, after: usize) -> Vec<LogLine> {
        source
            .read_lines_after(after)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn test_read_after_ignores_tail() {
        let mut file = five_line_file();
        let mut source = LocalSource::with_options(file.path(), Some(2), 512, PathPolicy::default());
        source.open().unwrap();
        assert_eq!(read_all(&mut source).len(), 2);

        for i in 6..=10 {
            writeln!(file, "Line {i}").unwrap();
        }
        file.flush().unwrap();

        source.close();
        source.open().unwrap();
        let numbers: Vec<usize> = read_after(&mut source, 5).iter().map(LogLine::line_number).collect();
        assert_eq!(numbers, vec![6, 7, 8, 9, 10]);
        assert_eq!(source.checkpoint, Some((5, 35)));

        writeln!(file, "Line 11").unwrap();
        file.flush().unwrap();
        let lines = read_after(&mut source, 10);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].line_number(), 11);
        assert_eq!(lines[0].content(), "Line 11");
        assert!(read_after(&mut source, 11).is_empty());
    }

    #[test]
    fn test_read_after_unterminated_and_truncated() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "one\ntwo").unwrap();
        file.flush().unwrap();

        let mut source = LocalSource::new(file.path(), None);
        source.open().unwrap();
        assert!(read_after(&mut source, 2).is_empty());
        assert_eq!(read_after(&mut source, 1)[0].content(), "two");

        std::fs::write(file.path(), "fresh\n").unwrap();
        source.close();
        source.open().unwrap();
        let lines = read_after(&mut source, 0);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].content(), "fresh");
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_permission_denied() {
        use std::os::unix::fs::PermissionsExt;

        let file = five_line_file();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o000)).unwrap();
        // root bypasses file permissions
        if std::fs::File::open(file.path()).is_ok() {
            return;
        }

        let mut source = LocalSource::new(file.path(), None);
        let err = source.open().unwrap_err();
        assert!(matches!(err, SourceError::PermissionDenied { .. }), "got {err:?}");
        assert!(!source.is_open());

        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600)).unwrap();
        source.open().unwrap();
    }

    #[test]
    fn test_file_info() {
        let file = five_line_file();
        let mut source = LocalSource::new(file.path(), None);
        source.open().unwrap();

        let info = source.file_info().unwrap();
        assert_eq!(info.size, 35);
        assert_eq!(info.total_lines, 5);
        assert!(info.modified.is_some());
        let name = file.path().file_name().unwrap().to_str().unwrap();
        assert!(info.path.ends_with(name));
    }
}
