// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use tracing::{debug, warn};

use super::{Checkpoint, CheckpointStore};
use crate::monitor::error::{Error, Result};
use crate::monitor::file_id::FileId;

/// Default cap on bytes returned by a single read.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 1024 * 1024;

/// Result of one read: complete lines only.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub data: Vec<u8>,
    /// Bytes of the file covered by `data`. Larger than `data.len()` when an
    /// overlong line was cut down to the batch cap.
    pub consumed: u64,
    /// The read reached the end of the file (a trailing partial line, if any,
    /// is left for the next read).
    pub eof: bool,
}

impl ReadBatch {
    pub fn is_empty(&self) -> bool {
        self.consumed == 0
    }
}

enum LineEnd {
    Newline,
    /// The line runs past the byte limit; only the limit was stored.
    Overflow,
    /// No newline before the end of the readable range.
    Eof,
}

/// Bounded line scanner over `[pos, end)` of a file.
struct Scanner {
    reader: BufReader<File>,
    pos: u64,
    end: u64,
}

impl Scanner {
    fn new(mut file: File, pos: u64, end: u64) -> io::Result<Self> {
        file.seek(SeekFrom::Start(pos))?;
        Ok(Self {
            reader: BufReader::new(file),
            pos,
            end,
        })
    }

    fn fill(&mut self) -> io::Result<&[u8]> {
        let left = (self.end - self.pos) as usize;
        let buf = self.reader.fill_buf()?;
        let n = buf.len().min(left);
        Ok(&buf[..n])
    }

    fn consume(&mut self, n: usize) {
        self.reader.consume(n);
        self.pos += n as u64;
    }

    /// Append the next line to `out`, storing at most `limit` bytes. Bytes
    /// are consumed only up to what was stored.
    fn next_line(&mut self, out: &mut Vec<u8>, limit: usize) -> io::Result<LineEnd> {
        let mut stored = 0;
        loop {
            let buf = self.fill()?;
            if buf.is_empty() {
                return Ok(LineEnd::Eof);
            }
            let room = limit - stored;
            match memchr(buf) {
                Some(i) if i < room => {
                    out.extend_from_slice(&buf[..=i]);
                    self.consume(i + 1);
                    return Ok(LineEnd::Newline);
                }
                _ if buf.len() >= room => {
                    out.extend_from_slice(&buf[..room]);
                    self.consume(room);
                    return Ok(LineEnd::Overflow);
                }
                _ => {
                    let n = buf.len();
                    out.extend_from_slice(buf);
                    stored += n;
                    self.consume(n);
                }
            }
        }
    }

    /// Consume through the next newline without storing. Returns false when
    /// the range ends first.
    fn skip_line(&mut self) -> io::Result<bool> {
        loop {
            let buf = self.fill()?;
            if buf.is_empty() {
                return Ok(false);
            }
            match memchr(buf) {
                Some(i) => {
                    self.consume(i + 1);
                    return Ok(true);
                }
                None => {
                    let n = buf.len();
                    self.consume(n);
                }
            }
        }
    }

    fn skip_to(&mut self, pos: u64) -> io::Result<()> {
        if pos > self.pos {
            self.reader.seek_relative((pos - self.pos) as i64)?;
            self.pos = pos;
        }
        Ok(())
    }
}

fn memchr(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|b| *b == b'\n')
}

/// Reads newly appended, newline-terminated records through a file's track
/// link, starting from the last persisted offset.
///
/// Offsets only move forward in `update_position`, after the caller has
/// handled the bytes. A crash in between re-delivers them.
pub struct CheckpointReader {
    store: CheckpointStore,
    max_batch_bytes: usize,
    positions: HashMap<FileId, Checkpoint>,
    /// Offset up to which the line starting at the checkpoint is known to
    /// hold no newline, so an unterminated tail is not rescanned per wakeup.
    unterminated: HashMap<FileId, u64>,
}

impl CheckpointReader {
    pub fn new(store: CheckpointStore) -> Self {
        Self {
            store,
            max_batch_bytes: DEFAULT_MAX_BATCH_BYTES,
            positions: HashMap::new(),
            unterminated: HashMap::new(),
        }
    }

    pub fn with_max_batch_bytes(mut self, max_batch_bytes: usize) -> Self {
        self.max_batch_bytes = max_batch_bytes.max(1);
        self
    }

    /// Current in-memory offset for `id`, if it has been read before.
    pub fn offset(&self, id: FileId) -> Option<u64> {
        self.positions.get(&id).map(|cp| cp.offset)
    }

    fn position(&mut self, id: FileId, track_link: &Path) -> &mut Checkpoint {
        let store = &self.store;
        let cp = self.positions.entry(id).or_insert_with(|| {
            match store.load(id) {
                Ok(Some(cp)) => {
                    debug!(file_id = %id, offset = cp.offset, "Resuming from checkpoint");
                    cp
                }
                Ok(None) => Checkpoint::new(id, track_link.to_path_buf(), 0),
                Err(e) => {
                    warn!(file_id = %id, error = %e, "Unreadable checkpoint, starting from the beginning");
                    Checkpoint::new(id, track_link.to_path_buf(), 0)
                }
            }
        });
        if cp.track_link != track_link {
            cp.track_link = track_link.to_path_buf();
        }
        cp
    }

    /// Read complete lines appended since the checkpoint.
    ///
    /// Returns an empty batch when no complete line follows the checkpoint.
    /// `data` never exceeds `max_batch_bytes`: whole lines are added while
    /// they fit, and a single line longer than the cap is cut to the cap
    /// (ending in a newline) while `consumed` covers all of it.
    pub fn read(&mut self, id: FileId, track_link: &Path) -> Result<ReadBatch> {
        let max_batch_bytes = self.max_batch_bytes;
        let offset = self.position(id, track_link).offset;

        let file = File::open(track_link).map_err(|source| Error::Identity {
            path: track_link.to_path_buf(),
            source,
        })?;
        let size = file.metadata()?.len();
        if size <= offset {
            if size < offset {
                debug!(file_id = %id, size, offset, "File is shorter than its checkpoint");
            }
            return Ok(ReadBatch {
                eof: true,
                ..Default::default()
            });
        }
        let scanned = match self.unterminated.get(&id).copied() {
            Some(scanned) if scanned <= size => scanned,
            _ => offset,
        };
        if scanned == size {
            return Ok(ReadBatch {
                eof: true,
                ..Default::default()
            });
        }

        let mut scanner = Scanner::new(file, offset, size)?;
        let mut batch = ReadBatch::default();

        // The first line may be longer than the whole batch.
        let mut first = Vec::new();
        match scanner.next_line(&mut first, max_batch_bytes)? {
            LineEnd::Newline => batch.data = first,
            LineEnd::Eof => {
                self.unterminated.insert(id, size);
                batch.eof = true;
                return Ok(batch);
            }
            LineEnd::Overflow => {
                let start = scanner.pos;
                scanner.skip_to(scanned.max(start))?;
                if !scanner.skip_line()? {
                    self.unterminated.insert(id, size);
                    batch.eof = true;
                    return Ok(batch);
                }
                warn!(
                    file_id = %id,
                    length = scanner.pos - offset,
                    max_batch_bytes,
                    "Line exceeds the batch cap, delivering it truncated"
                );
                first.pop();
                first.push(b'\n');
                batch.data = first;
            }
        }
        batch.consumed = scanner.pos - offset;

        let mut line = Vec::new();
        loop {
            let room = max_batch_bytes - batch.data.len();
            if room == 0 {
                break;
            }
            line.clear();
            match scanner.next_line(&mut line, room)? {
                LineEnd::Newline => {
                    batch.data.extend_from_slice(&line);
                    batch.consumed += line.len() as u64;
                }
                LineEnd::Overflow => break,
                LineEnd::Eof => {
                    batch.eof = true;
                    break;
                }
            }
        }
        if scanner.pos == size {
            batch.eof = true;
        }

        Ok(batch)
    }

    /// Advance the checkpoint for `id` by `consumed` bytes and persist it.
    ///
    /// Persistence failures are logged; the in-memory offset still moves.
    pub fn update_position(&mut self, id: FileId, consumed: u64) -> u64 {
        let Some(cp) = self.positions.get_mut(&id) else {
            warn!(file_id = %id, "Position update for a file that was never read");
            return 0;
        };
        cp.offset = cp.offset.saturating_add(consumed);
        if consumed > 0 {
            self.unterminated.remove(&id);
        }

        if let Err(e) = self.store.save(cp) {
            warn!(file_id = %id, offset = cp.offset, error = %e, "Failed to persist checkpoint");
        }
        cp.offset
    }

    /// Drop the in-memory position and the persisted record for `id`.
    pub fn forget(&mut self, id: FileId) -> Result<()> {
        self.positions.remove(&id);
        self.unterminated.remove(&id);
        self.store.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        state: TempDir,
        file: std::path::PathBuf,
        id: FileId,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        fs::write(&file, b"").unwrap();
        let id = FileId::from_path(&file).unwrap();
        Fixture {
            _dir: dir,
            state,
            file,
            id,
        }
    }

    fn append(path: &Path, data: &[u8]) {
        let mut f = OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(data).unwrap();
    }

    fn reader(f: &Fixture, namespace: &str) -> CheckpointReader {
        CheckpointReader::new(CheckpointStore::new(f.state.path(), namespace, false))
    }

    #[test]
    fn test_read_in_order_with_offsets() {
        let f = fixture();
        let mut r = reader(&f, "matcher.a");

        append(&f.file, b"x\n");
        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"x\n");
        assert!(batch.eof);
        assert_eq!(r.update_position(f.id, batch.data.len() as u64), 2);

        append(&f.file, b"y\n");
        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"y\n");
        assert_eq!(r.update_position(f.id, batch.data.len() as u64), 4);

        let batch = r.read(f.id, &f.file).unwrap();
        assert!(batch.data.is_empty());
        assert!(batch.eof);
    }

    #[test]
    fn test_partial_line_is_held_back() {
        let f = fixture();
        let mut r = reader(&f, "matcher.a");

        append(&f.file, b"one\ntw");
        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"one\n");
        assert!(batch.eof);
        r.update_position(f.id, batch.data.len() as u64);

        let batch = r.read(f.id, &f.file).unwrap();
        assert!(batch.data.is_empty());

        append(&f.file, b"o\n");
        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"two\n");
    }

    #[test]
    fn test_unacknowledged_bytes_are_redelivered() {
        let f = fixture();
        let mut r = reader(&f, "matcher.a");

        append(&f.file, b"a\n");
        assert_eq!(r.read(f.id, &f.file).unwrap().data, b"a\n");
        assert_eq!(r.read(f.id, &f.file).unwrap().data, b"a\n");
    }

    #[test]
    fn test_resume_after_restart() {
        let f = fixture();
        append(&f.file, b"first\nsecond\n");

        {
            let mut r = reader(&f, "matcher.a");
            let batch = r.read(f.id, &f.file).unwrap();
            assert_eq!(batch.data, b"first\nsecond\n");
            r.update_position(f.id, 6);
        }

        let mut r = reader(&f, "matcher.a");
        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"second\n");
        assert_eq!(r.offset(f.id), Some(6));
    }

    #[test]
    fn test_namespaces_are_independent() {
        let f = fixture();
        append(&f.file, b"l1\nl2\n");

        let mut a = reader(&f, "matcher.a");
        let mut b = reader(&f, "sender.b");

        let batch = a.read(f.id, &f.file).unwrap();
        a.update_position(f.id, batch.data.len() as u64);
        assert!(a.read(f.id, &f.file).unwrap().data.is_empty());

        assert_eq!(b.read(f.id, &f.file).unwrap().data, b"l1\nl2\n");

        let mut b2 = reader(&f, "sender.b");
        assert_eq!(b2.read(f.id, &f.file).unwrap().data, b"l1\nl2\n");
    }

    #[test]
    fn test_batch_cap() {
        let f = fixture();
        append(&f.file, b"aaaa\nbbbb\ncccc\n");
        let mut r = reader(&f, "matcher.a").with_max_batch_bytes(6);

        for (expected, eof) in [(&b"aaaa\n"[..], false), (b"bbbb\n", false), (b"cccc\n", true)] {
            let batch = r.read(f.id, &f.file).unwrap();
            assert_eq!(batch.data, expected);
            assert_eq!(batch.consumed, 5);
            assert_eq!(batch.eof, eof);
            r.update_position(f.id, batch.consumed);
        }
    }

    #[test]
    fn test_overlong_line_is_truncated_to_the_cap() {
        let f = fixture();
        append(&f.file, b"0123456789abcdef\nok\n");
        let mut r = reader(&f, "matcher.a").with_max_batch_bytes(8);

        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"0123456\n");
        assert_eq!(batch.consumed, 17);
        assert!(!batch.eof);
        assert_eq!(r.update_position(f.id, batch.consumed), 17);

        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"ok\n");
        assert!(batch.eof);
    }

    #[test]
    fn test_unterminated_tail_stays_bounded() {
        let f = fixture();
        append(&f.file, &[b'x'; 4096]);
        let mut r = reader(&f, "matcher.a").with_max_batch_bytes(8);

        let batch = r.read(f.id, &f.file).unwrap();
        assert!(batch.is_empty());
        assert!(batch.data.is_empty());
        assert!(batch.eof);
        assert!(r.read(f.id, &f.file).unwrap().is_empty());

        append(&f.file, b"\nnext\n");
        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"xxxxxxx\n");
        assert_eq!(batch.consumed, 4097);
        r.update_position(f.id, batch.consumed);

        let batch = r.read(f.id, &f.file).unwrap();
        assert_eq!(batch.data, b"next\n");
        assert!(batch.eof);
    }

    #[test]
    fn test_read_through_link_after_unlink() {
        let f = fixture();
        append(&f.file, b"kept\n");
        let link = crate::monitor::track_link::create(&f.file, f.id).unwrap();
        fs::remove_file(&f.file).unwrap();

        let mut r = reader(&f, "matcher.a");
        assert_eq!(r.read(f.id, &link).unwrap().data, b"kept\n");
    }

    #[test]
    fn test_forget_removes_record() {
        let f = fixture();
        append(&f.file, b"z\n");
        let mut r = reader(&f, "matcher.a");
        r.read(f.id, &f.file).unwrap();
        r.update_position(f.id, 2);
        r.forget(f.id).unwrap();

        let mut again = reader(&f, "matcher.a");
        assert_eq!(again.read(f.id, &f.file).unwrap().data, b"z\n");
    }
}
