//! Durable on-disk schema and the raw recorder.
//!
//! Each session writes one zstd-compressed JSON-lines file per stream kind:
//!
//! ```text
//! <root>/<YYYY-MM-DD>/<venue>/<SYMBOL>/<kind>/<kind>-<session>.jsonl.zst
//! ```
//!
//! The first line of every file is a [`RecordFrame::Header`]. Payload lines
//! keep the venue's JSON verbatim next to a CRC32 of its bytes. `seq` is one
//! counter shared by all kinds of a session: sorting the union of the files by
//! `seq` yields the exact order in which the reconciler saw them.
use crate::envelope::{Received, StreamKind};
use crate::snapshot::{FetchedSnapshot, now_unix_ns};
use crc32fast::Hasher as Crc32;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

pub const FORMAT_VERSION: u16 = 2;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("io error on {path:?}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("malformed record at {path:?}:{line}: {reason}")]
    Malformed { path: PathBuf, line: usize, reason: String },
    #[error("crc mismatch at {path:?}:{line}: file={file:#x}, calc={calc:#x}")]
    Checksum { path: PathBuf, line: usize, file: u32, calc: u32 },
    #[error("recorder writer stopped")]
    WriterStopped,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RecordError + '_ {
    move |source| RecordError::Io { path: path.to_path_buf(), source }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub version: u16,
    pub created_unix_ns: u64,
    pub venue: String,
    pub symbol: String,
    pub stream: StreamKind,
    pub session: String,
    /// Reconciler buffer capacity of the live session; replays need it to
    /// make the same buffer/evict decisions.
    pub pending_capacity: usize,
}

/// A venue payload, stored byte for byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub seq: u64,
    pub recv_unix_ns: u64,
    pub crc32: u32,
    pub raw: Box<RawValue>,
}

/// A received frame that did not parse as an envelope, kept as text since it
/// may not even be JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnparsedRecord {
    pub seq: u64,
    pub recv_unix_ns: u64,
    pub crc32: u32,
    pub reason: String,
    pub raw_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectMark {
    pub seq: u64,
    pub recv_unix_ns: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecordFrame {
    Header(FileHeader),
    Envelope(RawRecord),
    Snapshot(RawRecord),
    Disconnect(DisconnectMark),
    Unparsed(UnparsedRecord),
}

impl RecordFrame {
    pub fn seq(&self) -> Option<u64> {
        match self {
            RecordFrame::Header(_) => None,
            RecordFrame::Envelope(r) | RecordFrame::Snapshot(r) => Some(r.seq),
            RecordFrame::Disconnect(m) => Some(m.seq),
            RecordFrame::Unparsed(u) => Some(u.seq),
        }
    }
}

pub fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Where one capture session lives on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionLayout {
    pub root: PathBuf,
    /// UTC capture date, `YYYY-MM-DD`.
    pub date: String,
    pub venue: String,
    pub symbol: String,
    /// UTC start time `HHMMSS`, unique per symbol and day.
    pub session: String,
}

impl SessionLayout {
    pub fn new(root: impl Into<PathBuf>, venue: &str, symbol: &str, started: time::OffsetDateTime) -> Self {
        let date_fmt = time::macros::format_description!("[year]-[month]-[day]");
        let time_fmt = time::macros::format_description!("[hour][minute][second]");
        Self {
            root: root.into(),
            date: started.format(&date_fmt).unwrap_or_default(),
            venue: venue.to_lowercase(),
            symbol: symbol.to_uppercase(),
            session: started.format(&time_fmt).unwrap_or_default(),
        }
    }

    /// `<root>/<date>/<venue>/<SYMBOL>`
    pub fn base_dir(&self) -> PathBuf {
        self.root.join(&self.date).join(&self.venue).join(&self.symbol)
    }

    pub fn dir(&self, kind: StreamKind) -> PathBuf {
        self.base_dir().join(kind.as_str())
    }

    pub fn path(&self, kind: StreamKind) -> PathBuf {
        self.dir(kind).join(format!("{}-{}.jsonl.zst", kind.as_str(), self.session))
    }
}

/// Line counts per kind, returned when the recorder closes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub depth_lines: u64,
    pub trade_lines: u64,
    pub snapshot_lines: u64,
    pub disconnect_marks: u64,
    pub unparsed_lines: u64,
}

struct Partition {
    path: PathBuf,
    encoder: zstd::stream::write::Encoder<'static, BufWriter<File>>,
}

impl Partition {
    fn create(path: PathBuf, header: &FileHeader) -> Result<Self, RecordError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        // create_new: a session never appends to or truncates someone else's file
        let file = OpenOptions::new().write(true).create_new(true).open(&path).map_err(io_err(&path))?;
        let encoder = zstd::stream::write::Encoder::new(BufWriter::with_capacity(1 << 20, file), 3)
            .map_err(io_err(&path))?;
        let mut part = Self { path, encoder };
        part.write(&RecordFrame::Header(header.clone()))?;
        Ok(part)
    }

    fn write(&mut self, frame: &RecordFrame) -> Result<(), RecordError> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');
        self.encoder.write_all(&line).map_err(io_err(&self.path))
    }

    fn flush(&mut self) -> Result<(), RecordError> {
        self.encoder.flush().map_err(io_err(&self.path))
    }

    fn finish(self) -> Result<(), RecordError> {
        let path = self.path;
        let mut inner = self.encoder.finish().map_err(io_err(&path))?;
        inner.flush().map_err(io_err(&path))?;
        inner.get_ref().sync_all().map_err(io_err(&path))
    }
}

struct WriteCmd {
    kind: StreamKind,
    frame: RecordFrame,
}

/// Append-only recorder. Frames are numbered on the caller's thread and
/// written, in that order, by a dedicated writer thread.
pub struct RawRecorder {
    layout: SessionLayout,
    tx: Option<Sender<WriteCmd>>,
    handle: Option<JoinHandle<Result<RecorderStats, RecordError>>>,
    next_seq: u64,
}

impl RawRecorder {
    /// Create all partitions for the session up front so that storage
    /// problems surface before any network activity.
    pub fn open(
        layout: SessionLayout,
        pending_capacity: usize,
        queue: usize,
        flush_interval: Duration,
    ) -> Result<Self, RecordError> {
        let mut parts = HashMap::new();
        let created_unix_ns = now_unix_ns();
        for kind in StreamKind::ALL {
            let header = FileHeader {
                version: FORMAT_VERSION,
                created_unix_ns,
                venue: layout.venue.clone(),
                symbol: layout.symbol.clone(),
                stream: kind,
                session: layout.session.clone(),
                pending_capacity,
            };
            parts.insert(kind, Partition::create(layout.path(kind), &header)?);
        }
        info!(dir = %layout.base_dir().display(), session = %layout.session, "raw recorder opened");
        let (tx, rx) = bounded::<WriteCmd>(queue.max(1));
        let handle = std::thread::Builder::new()
            .name("raw-recorder".into())
            .spawn(move || writer_thread(parts, rx, flush_interval))
            .map_err(|source| RecordError::Io { path: PathBuf::new(), source })?;
        Ok(Self { layout, tx: Some(tx), handle: Some(handle), next_seq: 0 })
    }

    pub fn layout(&self) -> &SessionLayout {
        &self.layout
    }

    fn send(&mut self, kind: StreamKind, frame: RecordFrame) -> Result<u64, RecordError> {
        let seq = frame.seq().unwrap_or_default();
        let tx = self.tx.as_ref().ok_or(RecordError::WriterStopped)?;
        tx.send(WriteCmd { kind, frame }).map_err(|_| RecordError::WriterStopped)?;
        Ok(seq)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Record a stream envelope in its partition; returns its `seq`.
    pub fn record_envelope(&mut self, received: &Received) -> Result<u64, RecordError> {
        let seq = self.take_seq();
        let record = RawRecord {
            seq,
            recv_unix_ns: received.recv_unix_ns,
            crc32: crc32(received.raw.get().as_bytes()),
            raw: received.raw.clone(),
        };
        self.send(received.envelope.kind(), RecordFrame::Envelope(record))
    }

    pub fn record_snapshot(&mut self, fetched: &FetchedSnapshot) -> Result<u64, RecordError> {
        let seq = self.take_seq();
        let record = RawRecord {
            seq,
            recv_unix_ns: fetched.snapshot.captured_at_ns,
            crc32: crc32(fetched.raw.get().as_bytes()),
            raw: fetched.raw.clone(),
        };
        self.send(StreamKind::Snapshots, RecordFrame::Snapshot(record))
    }

    /// Disconnects go into the depth partition; replays need them to reset.
    pub fn record_disconnect(&mut self, reason: &str) -> Result<u64, RecordError> {
        let seq = self.take_seq();
        let mark = DisconnectMark { seq, recv_unix_ns: now_unix_ns(), reason: reason.to_string() };
        self.send(StreamKind::Depth, RecordFrame::Disconnect(mark))
    }

    /// Record a frame that failed to parse, in the partition its stream name
    /// points at.
    pub fn record_unparsed(&mut self, text: &str, recv_unix_ns: u64, reason: &str) -> Result<u64, RecordError> {
        let seq = self.take_seq();
        let record = UnparsedRecord {
            seq,
            recv_unix_ns,
            crc32: crc32(text.as_bytes()),
            reason: reason.to_string(),
            raw_text: text.to_string(),
        };
        self.send(StreamKind::for_unparsed(text), RecordFrame::Unparsed(record))
    }

    /// Flush, finish every zstd frame and fsync. Returns the writer's error
    /// if it stopped early.
    pub fn close(mut self) -> Result<RecorderStats, RecordError> {
        drop(self.tx.take());
        match self.handle.take() {
            Some(handle) => handle.join().map_err(|_| RecordError::WriterStopped)?,
            None => Err(RecordError::WriterStopped),
        }
    }
}

fn writer_thread(
    mut parts: HashMap<StreamKind, Partition>,
    rx: Receiver<WriteCmd>,
    flush_interval: Duration,
) -> Result<RecorderStats, RecordError> {
    let mut stats = RecorderStats::default();
    let mut dirty = false;
    let result = loop {
        match rx.recv_timeout(flush_interval) {
            Ok(cmd) => {
                let Some(part) = parts.get_mut(&cmd.kind) else { continue };
                if let Err(e) = part.write(&cmd.frame) {
                    break Err(e);
                }
                dirty = true;
                match (&cmd.frame, cmd.kind) {
                    (RecordFrame::Disconnect(_), _) => stats.disconnect_marks += 1,
                    (RecordFrame::Unparsed(_), _) => stats.unparsed_lines += 1,
                    (_, StreamKind::Depth) => stats.depth_lines += 1,
                    (_, StreamKind::Trades) => stats.trade_lines += 1,
                    (_, StreamKind::Snapshots) => stats.snapshot_lines += 1,
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if dirty {
                    if let Err(e) = parts.values_mut().try_for_each(Partition::flush) {
                        break Err(e);
                    }
                    dirty = false;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break Ok(()),
        }
    };
    if let Err(e) = result {
        error!(error = %e, "raw recorder write failed");
        return Err(e);
    }
    for (_, part) in parts.drain() {
        part.finish()?;
    }
    debug!(?stats, "raw recorder closed");
    Ok(stats)
}

/// Read every frame of one partition, verifying payload checksums.
pub fn read_frames(path: &Path) -> Result<Vec<RecordFrame>, RecordError> {
    let file = File::open(path).map_err(io_err(path))?;
    let decoder = zstd::stream::read::Decoder::new(file).map_err(io_err(path))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(decoder).lines().enumerate() {
        let line = line.map_err(io_err(path))?;
        if line.trim().is_empty() {
            continue;
        }
        let frame: RecordFrame = serde_json::from_str(&line).map_err(|e| RecordError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: e.to_string(),
        })?;
        let checked = match &frame {
            RecordFrame::Envelope(r) | RecordFrame::Snapshot(r) => Some((r.crc32, crc32(r.raw.get().as_bytes()))),
            RecordFrame::Unparsed(u) => Some((u.crc32, crc32(u.raw_text.as_bytes()))),
            _ => None,
        };
        if let Some((file, calc)) = checked {
            if calc != file {
                return Err(RecordError::Checksum { path: path.to_path_buf(), line: idx + 1, file, calc });
            }
        }
        out.push(frame);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Received;

    fn layout(root: &Path) -> SessionLayout {
        let started = time::macros::datetime!(2024-03-05 07:08:09 UTC);
        SessionLayout::new(root, "Binance", "btcusdt", started)
    }

    #[test]
    fn layout_partitions_by_date_venue_symbol_kind() {
        let l = layout(Path::new("raw"));
        assert_eq!(
            l.path(StreamKind::Depth),
            PathBuf::from("raw/2024-03-05/binance/BTCUSDT/depth/depth-070809.jsonl.zst")
        );
        assert_eq!(l.dir(StreamKind::Snapshots), PathBuf::from("raw/2024-03-05/binance/BTCUSDT/snapshots"));
    }

    #[test]
    fn writes_and_reads_back_with_shared_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = RawRecorder::open(layout(dir.path()), 32, 16, Duration::from_millis(10)).unwrap();
        let depth = r#"{"e":"depthUpdate","U":1,"u":2,"b":[["1.0","2"]],"a":[]}"#;
        let trade = r#"{"e":"trade","t":1,"p":"1.0","q":"1","T":5,"m":false}"#;
        assert_eq!(rec.record_envelope(&Received::ingest(depth.into(), 1).unwrap()).unwrap(), 0);
        assert_eq!(rec.record_envelope(&Received::ingest(trade.into(), 2).unwrap()).unwrap(), 1);
        assert_eq!(rec.record_disconnect("closed").unwrap(), 2);
        let snap = FetchedSnapshot::from_body(r#"{"lastUpdateId":9,"bids":[],"asks":[]}"#.into(), 3).unwrap();
        assert_eq!(rec.record_snapshot(&snap).unwrap(), 3);
        let garbage = "{not json at all";
        assert_eq!(rec.record_unparsed(garbage, 4, "expected value").unwrap(), 4);
        let l = rec.layout().clone();
        let stats = rec.close().unwrap();
        assert_eq!(
            stats,
            RecorderStats { depth_lines: 1, trade_lines: 1, snapshot_lines: 1, disconnect_marks: 1, unparsed_lines: 1 }
        );

        let frames = read_frames(&l.path(StreamKind::Depth)).unwrap();
        assert_eq!(frames.len(), 4);
        assert!(matches!(
            &frames[0],
            RecordFrame::Header(h) if h.stream == StreamKind::Depth && h.symbol == "BTCUSDT" && h.pending_capacity == 32
        ));
        match &frames[1] {
            RecordFrame::Envelope(r) => {
                assert_eq!(r.seq, 0);
                assert_eq!(r.raw.get(), depth);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&frames[2], RecordFrame::Disconnect(m) if m.seq == 2));
        assert!(matches!(&frames[3], RecordFrame::Unparsed(u) if u.seq == 4 && u.raw_text == garbage));
        let snaps = read_frames(&l.path(StreamKind::Snapshots)).unwrap();
        assert!(matches!(&snaps[1], RecordFrame::Snapshot(r) if r.seq == 3));
    }

    #[test]
    fn refuses_to_overwrite_existing_session() {
        let dir = tempfile::tempdir().unwrap();
        let first = RawRecorder::open(layout(dir.path()), 32, 4, Duration::from_millis(10)).unwrap();
        first.close().unwrap();
        let err = RawRecorder::open(layout(dir.path()), 32, 4, Duration::from_millis(10)).err().unwrap();
        assert!(matches!(err, RecordError::Io { .. }));
    }

    #[test]
    fn crc_mismatch_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jsonl.zst");
        let raw = RawValue::from_string(r#"{"e":"trade"}"#.to_string()).unwrap();
        let frame = RecordFrame::Envelope(RawRecord { seq: 0, recv_unix_ns: 0, crc32: 0xDEADBEEF, raw });
        let mut line = serde_json::to_vec(&frame).unwrap();
        line.push(b'\n');
        fs::write(&path, zstd::encode_all(line.as_slice(), 3).unwrap()).unwrap();
        let err = read_frames(&path).unwrap_err();
        assert!(matches!(err, RecordError::Checksum { line: 1, file: 0xDEADBEEF, .. }));
    }
}
