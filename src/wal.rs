use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "event too large"))?;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

/// Read one `[len][payload][crc]` frame. `Ok(None)` means a clean or torn end.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    if !read_or_eof(reader, &mut len_buf)? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    if !read_or_eof(reader, &mut payload)? {
        return Ok(None);
    }
    let mut crc_buf = [0u8; 4];
    if !read_or_eof(reader, &mut crc_buf)? {
        return Ok(None);
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

fn read_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Append-only journal of pool and reservation events.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`.
/// A torn or corrupt tail (crash mid-write) is dropped on replay; everything
/// before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
        })
    }

    /// Append and fsync one event. The writer task batches instead.
    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event without syncing. Durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End of the log on disk. Only meaningful between batches, when nothing
    /// is buffered.
    pub fn end_offset(&self) -> io::Result<u64> {
        Ok(self.writer.get_ref().metadata()?.len())
    }

    /// Cut the log back to `offset`, dropping buffered bytes unwritten and
    /// any frames (whole or torn) already written past it.
    pub fn truncate_to(&mut self, offset: u64) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (_, _unwritten) = old.into_parts();
        let file = self.writer.get_ref();
        file.set_len(offset)?;
        file.sync_all()
    }

    /// Replace the log with `events`: write a temp file, fsync, rename over.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for event in events {
                encode_event(&mut tmp, event)?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }
        self.writer.flush()?;
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        Ok(())
    }

    /// Read every intact event from disk. A missing file is an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(read_log(path)?.events)
    }

    /// Replay, then cut off whatever follows the last intact frame so new
    /// appends are not hidden behind a torn one.
    pub fn recover(path: &Path) -> io::Result<Vec<Event>> {
        let log = read_log(path)?;
        if log.file_len > log.intact_len {
            warn!(
                path = %path.display(),
                dropped_bytes = log.file_len - log.intact_len,
                "truncating torn WAL tail"
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(log.intact_len)?;
            file.sync_all()?;
        }
        Ok(log.events)
    }
}

struct LogContents {
    events: Vec<Event>,
    /// Bytes up to the end of the last intact frame.
    intact_len: u64,
    file_len: u64,
}

fn read_log(path: &Path) -> io::Result<LogContents> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Ok(LogContents {
                events: Vec::new(),
                intact_len: 0,
                file_len: 0,
            });
        }
        Err(e) => return Err(e),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut events = Vec::new();
    let mut intact_len = 0u64;

    while let Some(payload) = read_frame(&mut reader)? {
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => {
                events.push(event);
                intact_len += FRAME_OVERHEAD + payload.len() as u64;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "undecodable WAL entry, dropping tail");
                break;
            }
        }
    }

    Ok(LogContents {
        events,
        intact_len,
        file_len,
    })
}
