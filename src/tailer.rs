use std::{
    fs::File,
    io::{BufRead, BufReader, Seek, SeekFrom},
    os::unix::fs::MetadataExt,
    path::PathBuf,
};

use log::debug;

pub const DEFAULT_MAX_LINES: usize = 2000;

/// A minimal `tail -F`: yields lines appended since the last call and follows
/// the path across rotation by tracking the inode.
pub struct LogTailer {
    path: PathBuf,
    start_at_end: bool,
    reader: Option<BufReader<File>>,
    inode: Option<u64>,
    pos: u64,
    opened_once: bool,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, start_at_end: bool) -> LogTailer {
        LogTailer {
            path: path.into(),
            start_at_end,
            reader: None,
            inode: None,
            pos: 0,
            opened_once: false,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn try_open(&mut self) {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            // Not there yet (or stat raced a rotation): retry next call.
            Err(_) => return,
        };
        let inode = meta.ino();

        if self.reader.is_none() {
            let Ok(file) = File::open(&self.path) else {
                return;
            };
            let mut reader = BufReader::new(file);
            self.inode = Some(inode);
            if self.start_at_end && !self.opened_once {
                match reader.seek(SeekFrom::End(0)) {
                    Ok(pos) => self.pos = pos,
                    Err(_) => return,
                }
            } else if reader.seek(SeekFrom::Start(self.pos)).is_err() {
                return;
            }
            self.opened_once = true;
            self.reader = Some(reader);
            return;
        }

        if self.inode != Some(inode) {
            debug!("{} rotated, reopening", self.path.display());
            self.reader = None;
            self.inode = None;
            self.pos = 0;
            let Ok(file) = File::open(&self.path) else {
                return;
            };
            self.inode = Some(inode);
            self.reader = Some(BufReader::new(file));
        }
    }

    /// Read up to `max_lines` newly appended complete lines. A trailing
    /// partial line without a newline is left for a later call.
    pub fn read_available(&mut self, max_lines: usize) -> Vec<String> {
        self.try_open();
        let Some(reader) = self.reader.as_mut() else {
            return Vec::new();
        };

        let mut out = Vec::new();
        let mut buf = Vec::new();
        let mut failed = false;
        while out.len() < max_lines {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if buf.last() != Some(&b'\n') {
                        // Partial tail: rewind so it is re-read once complete.
                        failed = reader.seek(SeekFrom::Start(self.pos)).is_err();
                        break;
                    }
                    self.pos += n as u64;
                    let line = String::from_utf8_lossy(&buf);
                    out.push(line.trim_end_matches(['\n', '\r']).to_owned());
                }
                Err(err) => {
                    debug!("read error on {}: {err}", self.path.display());
                    failed = true;
                    break;
                }
            }
        }
        if failed {
            self.reset();
        }
        out
    }

    fn reset(&mut self) {
        self.reader = None;
        self.inode = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    fn append(path: &std::path::Path, text: &str) {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    #[test]
    fn reads_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        let mut tailer = LogTailer::new(&path, false);

        assert!(tailer.read_available(DEFAULT_MAX_LINES).is_empty());

        append(&path, "one\ntwo\n");
        assert_eq!(tailer.read_available(DEFAULT_MAX_LINES), ["one", "two"]);
        assert!(tailer.read_available(DEFAULT_MAX_LINES).is_empty());

        append(&path, "three\n");
        assert_eq!(tailer.read_available(DEFAULT_MAX_LINES), ["three"]);
    }

    #[test]
    fn start_at_end_skips_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "old\n");

        let mut tailer = LogTailer::new(&path, true);
        assert!(tailer.read_available(DEFAULT_MAX_LINES).is_empty());

        append(&path, "new\n");
        assert_eq!(tailer.read_available(DEFAULT_MAX_LINES), ["new"]);
    }

    #[test]
    fn survives_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        let mut tailer = LogTailer::new(&path, false);

        append(&path, "a\nb\n");
        assert_eq!(tailer.read_available(DEFAULT_MAX_LINES), ["a", "b"]);

        fs::rename(&path, dir.path().join("auth.log.1")).unwrap();
        append(&path, "c\n");
        assert_eq!(tailer.read_available(DEFAULT_MAX_LINES), ["c"]);
    }

    #[test]
    fn holds_partial_line_until_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        let mut tailer = LogTailer::new(&path, false);

        append(&path, "half");
        assert!(tailer.read_available(DEFAULT_MAX_LINES).is_empty());

        append(&path, "-full\n");
        assert_eq!(tailer.read_available(DEFAULT_MAX_LINES), ["half-full"]);
    }

    #[test]
    fn respects_max_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.log");
        let mut tailer = LogTailer::new(&path, false);

        append(&path, "1\n2\n3\n");
        assert_eq!(tailer.read_available(2), ["1", "2"]);
        assert_eq!(tailer.read_available(2), ["3"]);
    }
}
