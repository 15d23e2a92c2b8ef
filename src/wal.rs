//! Durability hand-off for committed batches.
//!
//! The head only depends on [`DurabilityLog`]. [`WriteAheadLog`] is the file-backed
//! implementation used for restart recovery; [`NoopLog`] keeps everything in memory.
//!
//! File layout of `wal.log`:
//! - header: magic `TSHWAL01`, `u32` format version, `u32` stripe size (little endian)
//! - frames: `u32 len | u32 crc32(payload) | payload`, one per committed batch, gc pass or
//!   truncation. A checkpoint rewrites the file as the header plus a single frame.
//!
//! The payload is a bincode-encoded `Vec<LogRecord>`.

use crate::error::HeadError;
use crate::labels::Labels;
use crate::telemetry::head_metrics;
use crate::types::{RefSample, SeriesRef, Timestamp};
use crc32fast::Hasher as Crc32;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

const WAL_MAGIC: &[u8; 8] = b"TSHWAL01";
const WAL_VERSION: u32 = 1;
const HEADER_LEN: u64 = 16;
const WAL_FILE: &str = "wal.log";

/// Sink for serialized committed batches.
pub trait DurabilityLog: Debug + Send + Sync + 'static {
    /// Appends one encoded batch. An error aborts the commit that produced it.
    fn append(&self, batch: &[u8]) -> Result<(), HeadError>;

    /// Replaces everything logged so far with `state`, one encoded batch describing the
    /// whole head. Logs that cannot be rewritten keep growing.
    fn checkpoint(&self, _state: &[u8]) -> Result<(), HeadError> {
        Ok(())
    }
}

/// Discards every batch.
#[derive(Debug, Default)]
pub struct NoopLog;

impl DurabilityLog for NoopLog {
    #[inline]
    fn append(&self, _batch: &[u8]) -> Result<(), HeadError> {
        Ok(())
    }
}

/// One record inside a logged batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LogRecord {
    Series {
        series_ref: SeriesRef,
        /// Fingerprint the series was filed under.
        fingerprint: u64,
        labels: Labels,
    },
    Samples(Vec<RefSample>),
    /// Series unlinked by gc or rollback.
    Removed(Vec<SeriesRef>),
    /// `truncate_chunks_before` was called with this bound.
    MinValidTime(Timestamp),
    /// Per-shard sequence counters at checkpoint time.
    NextSeq(Vec<u64>),
}

pub fn encode_batch(records: &[LogRecord]) -> Result<Vec<u8>, HeadError> {
    Ok(bincode::serialize(records)?)
}

pub fn decode_batch(payload: &[u8]) -> Result<Vec<LogRecord>, HeadError> {
    Ok(bincode::deserialize(payload)?)
}

/// Everything read back from a log directory.
#[derive(Debug, Default)]
pub struct WalContents {
    pub stripe_size: Option<usize>,
    pub batches: Vec<Vec<LogRecord>>,
    /// True when the file ended in a partially written frame, which was ignored.
    pub torn_tail: bool,
    /// Length of the header plus every complete frame.
    pub valid_len: u64,
}

/// Backing file of a log.
trait LogFile: Write + Send {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

/// Appends frames and keeps the file ending on a frame boundary.
#[derive(Debug)]
struct LogWriter<F> {
    file: F,
    /// Bytes of header and complete frames.
    len: u64,
    /// Set when a partial frame could not be cut off again.
    closed: bool,
}

impl<F: LogFile> LogWriter<F> {
    fn new(file: F, len: u64) -> Self {
        Self {
            file,
            len,
            closed: false,
        }
    }

    fn append_frame(&mut self, batch: &[u8], sync: bool) -> Result<(), HeadError> {
        if self.closed {
            return Err(HeadError::LogClosed);
        }
        let frame = encode_frame(batch)?;
        if let Err(e) = self.write_frame(&frame, sync) {
            // A failed append must leave no bytes behind: neither the next frame nor replay
            // may see the rejected batch.
            if self.file.truncate_to(self.len).is_err() {
                self.closed = true;
            }
            return Err(HeadError::Io(e));
        }
        self.len += frame.len() as u64;
        head_metrics::record_log_bytes_written(frame.len() as u64);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[u8], sync: bool) -> io::Result<()> {
        self.file.write_all(frame)?;
        self.file.flush()?;
        if sync {
            let start = Instant::now();
            self.file.sync()?;
            head_metrics::record_log_fsync(start.elapsed());
        }
        Ok(())
    }
}

/// Append-only, checksummed batch log in a single file.
#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    stripe_size: usize,
    writer: Mutex<LogWriter<File>>,
    sync_on_append: bool,
}

impl WriteAheadLog {
    /// Opens (or creates) `wal.log` in `dir`. See [`WriteAheadLog::open_and_read`].
    pub fn open<P: AsRef<Path>>(
        dir: P,
        stripe_size: usize,
        sync_on_append: bool,
    ) -> Result<Self, HeadError> {
        Self::open_and_read(dir, stripe_size, sync_on_append).map(|(wal, _)| wal)
    }

    /// Opens (or creates) `wal.log` in `dir` and returns what it already holds.
    ///
    /// A fresh file gets a header recording `stripe_size`. An existing file must carry the
    /// same stripe size, since logged references encode their shard. A torn tail is cut off
    /// so that new frames follow the last complete one.
    pub fn open_and_read<P: AsRef<Path>>(
        dir: P,
        stripe_size: usize,
        sync_on_append: bool,
    ) -> Result<(Self, WalContents), HeadError> {
        fs::create_dir_all(&dir)?;
        let path = dir.as_ref().join(WAL_FILE);
        let contents = if path.exists() {
            read_log(&path)?
        } else {
            WalContents::default()
        };
        if let Some(logged) = contents.stripe_size {
            if logged != stripe_size {
                return Err(HeadError::Config(format!(
                    "log {} was written with stripe size {}, head configured with {}",
                    path.display(),
                    logged,
                    stripe_size
                )));
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = if contents.stripe_size.is_none() {
            file.set_len(0)?;
            write_header(&mut file, stripe_size)?;
            file.sync_data()?;
            HEADER_LEN
        } else {
            if contents.torn_tail {
                file.set_len(contents.valid_len)?;
                file.sync_data()?;
            }
            contents.valid_len
        };

        let wal = Self {
            path,
            stripe_size,
            writer: Mutex::new(LogWriter::new(file, len)),
            sync_on_append,
        };
        Ok((wal, contents))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads every complete batch in `dir`. A missing log yields empty contents.
    pub fn read_dir<P: AsRef<Path>>(dir: P) -> Result<WalContents, HeadError> {
        let path = dir.as_ref().join(WAL_FILE);
        if !path.exists() {
            return Ok(WalContents::default());
        }
        read_log(&path)
    }

    /// Syncs file data.
    pub fn sync(&self) -> Result<(), HeadError> {
        let mut w = self.writer.lock()?;
        let start = Instant::now();
        w.file.sync()?;
        head_metrics::record_log_fsync(start.elapsed());
        Ok(())
    }

    /// Size of the header plus every complete frame.
    pub fn size_bytes(&self) -> Result<u64, HeadError> {
        Ok(self.writer.lock()?.len)
    }
}

impl DurabilityLog for WriteAheadLog {
    fn append(&self, batch: &[u8]) -> Result<(), HeadError> {
        self.writer.lock()?.append_frame(batch, self.sync_on_append)
    }

    /// Writes `state` to a temporary file and renames it over `wal.log`.
    fn checkpoint(&self, state: &[u8]) -> Result<(), HeadError> {
        let mut w = self.writer.lock()?;
        if w.closed {
            return Err(HeadError::LogClosed);
        }
        let tmp = self.path.with_extension("log.tmp");
        let frame = encode_frame(state)?;
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            write_header(&mut f, self.stripe_size)?;
            f.write_all(&frame)?;
            f.flush()?;
            f.sync_data()?;
        }
        fs::rename(&tmp, &self.path)?;

        // The old handle now points at the replaced file.
        let reopened = self
            .path
            .parent()
            .map_or(Ok(()), sync_dir)
            .and_then(|()| Ok(OpenOptions::new().append(true).open(&self.path)?));
        match reopened {
            Ok(file) => {
                *w = LogWriter::new(file, HEADER_LEN + frame.len() as u64);
                head_metrics::record_log_bytes_written(frame.len() as u64);
                Ok(())
            }
            Err(e) => {
                w.closed = true;
                Err(e)
            }
        }
    }
}

fn encode_frame(batch: &[u8]) -> Result<Vec<u8>, HeadError> {
    let len = u32::try_from(batch.len())
        .map_err(|_| HeadError::Serialization(format!("batch of {} bytes too large", batch.len())))?;
    let mut hasher = Crc32::new();
    hasher.update(batch);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(8 + batch.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(batch);
    Ok(frame)
}

fn write_header<W: Write>(w: &mut W, stripe_size: usize) -> Result<(), HeadError> {
    let stripes = u32::try_from(stripe_size)
        .map_err(|_| HeadError::Config(format!("stripe size {} too large", stripe_size)))?;
    w.write_all(WAL_MAGIC)?;
    w.write_all(&WAL_VERSION.to_le_bytes())?;
    w.write_all(&stripes.to_le_bytes())?;
    w.flush()?;
    Ok(())
}

fn sync_dir(dir: &Path) -> Result<(), HeadError> {
    File::open(dir)?.sync_data()?;
    Ok(())
}

fn read_header<R: Read>(r: &mut R) -> Result<usize, HeadError> {
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)?;
    if &magic != WAL_MAGIC {
        return Err(HeadError::Corruption {
            details: "bad log magic".to_string(),
            offset: Some(0),
        });
    }
    let mut b4 = [0u8; 4];
    r.read_exact(&mut b4)?;
    let version = u32::from_le_bytes(b4);
    if version != WAL_VERSION {
        return Err(HeadError::Corruption {
            details: format!("unsupported log version {}", version),
            offset: Some(8),
        });
    }
    r.read_exact(&mut b4)?;
    Ok(u32::from_le_bytes(b4) as usize)
}

/// Fills `buf` completely, or returns `false` if the input ends first.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, HeadError> {
    match r.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(HeadError::Io(e)),
    }
}

fn read_log(path: &Path) -> Result<WalContents, HeadError> {
    let file_len = fs::metadata(path)?.len();
    let reader = BufReader::new(File::open(path)?);
    read_frames(reader, file_len).map_err(|e| match e {
        HeadError::Corruption { details, offset } => HeadError::Corruption {
            details: format!("{} in {}", details, path.display()),
            offset,
        },
        other => other,
    })
}

fn read_frames<R: Read>(mut reader: R, file_len: u64) -> Result<WalContents, HeadError> {
    let mut contents = WalContents::default();
    if file_len < HEADER_LEN {
        // Crash while writing the header: nothing was ever committed to this file.
        contents.torn_tail = file_len > 0;
        return Ok(contents);
    }
    contents.stripe_size = Some(read_header(&mut reader)?);
    contents.valid_len = HEADER_LEN;

    let mut offset = HEADER_LEN;
    loop {
        let mut frame = [0u8; 8];
        let mut got = 0;
        // Distinguish a clean end from a frame header cut short.
        while got < frame.len() {
            let n = reader.read(&mut frame[got..])?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            break;
        }
        if got < frame.len() {
            contents.torn_tail = true;
            break;
        }
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as u64;
        let crc = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if offset + 8 + len > file_len {
            contents.torn_tail = true;
            break;
        }
        let mut payload = vec![0u8; len as usize];
        if !read_full(&mut reader, &mut payload)? {
            contents.torn_tail = true;
            break;
        }
        let mut hasher = Crc32::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            let last_frame = offset + 8 + len == file_len;
            if last_frame {
                contents.torn_tail = true;
                break;
            }
            return Err(HeadError::Corruption {
                details: "checksum mismatch".to_string(),
                offset: Some(offset),
            });
        }
        let records = decode_batch(&payload).map_err(|e| HeadError::Corruption {
            details: format!("undecodable batch: {}", e),
            offset: Some(offset),
        })?;
        contents.batches.push(records);
        offset += 8 + len;
        contents.valid_len = offset;
    }
    Ok(contents)
}
