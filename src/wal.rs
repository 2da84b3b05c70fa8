use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::limits::MAX_FRAME_LEN;
use crate::model::Event;

/// Bytes of framing around each payload: the length word and the checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frame layout on disk: `[u32 LE payload len][bincode Event][u32 LE crc32(payload)]`.
fn write_frame(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("WAL record of {} bytes exceeds the frame limit", payload.len()),
        ));
    }
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Fill `buf` completely. `Ok(false)` means the file ended first.
fn read_full(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Next intact frame and its size on disk, or `None` at end of log. A short,
/// oversized, checksum-failing or undecodable frame is treated as the end: it
/// is the tail of a crashed write.
fn read_frame(input: &mut impl Read) -> io::Result<Option<(Event, u64)>> {
    let mut word = [0u8; 4];
    if !read_full(input, &mut word)? {
        return Ok(None);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }
    let mut payload = vec![0u8; len];
    if !read_full(input, &mut payload)? || !read_full(input, &mut word)? {
        return Ok(None);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(bincode::deserialize(&payload)
        .ok()
        .map(|event| (event, len as u64 + FRAME_OVERHEAD)))
}

/// Append-only log of committed transactions for one tenant.
///
/// Each frame holds exactly one `Event`, so a transaction is either fully
/// on disk or absent after a crash.
pub struct Wal {
    out: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open the log for appending. A torn tail left by a crash is cut off
    /// first, so new frames land directly after the last intact one.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (_, intact) = Self::scan(path)?;
        if let Ok(meta) = fs::metadata(path) {
            if meta.len() > intact {
                tracing::warn!(
                    "discarding {} bytes of torn WAL tail in {}",
                    meta.len() - intact,
                    path.display()
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(intact)?;
                file.sync_all()?;
            }
        }
        Ok(Self {
            out: BufWriter::new(Self::open_append(path)?),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    fn open_append(path: &Path) -> io::Result<File> {
        OpenOptions::new().create(true).append(true).open(path)
    }

    fn staging_path(&self) -> PathBuf {
        self.path.with_extension("wal.tmp")
    }

    /// Buffer one frame. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.out, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Replace the log with `snapshot`. The snapshot is written and synced to a
    /// staging file first, then renamed over the log, so a crash mid-compaction
    /// leaves the old log intact.
    pub fn rewrite(&mut self, snapshot: &[Event]) -> io::Result<()> {
        self.flush_sync()?;
        let staging = self.staging_path();
        {
            let mut out = BufWriter::new(File::create(&staging)?);
            for event in snapshot {
                write_frame(&mut out, event)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
        }
        fs::rename(&staging, &self.path)?;
        self.out = BufWriter::new(Self::open_append(&self.path)?);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every intact event in the log at `path`, oldest first. A missing file is
    /// an empty log.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(Self::scan(path)?.0)
    }

    /// Intact events plus the byte length they occupy from the start of the file.
    fn scan(path: &Path) -> io::Result<(Vec<Event>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut input = BufReader::new(file);
        let mut events = Vec::new();
        let mut intact = 0;
        while let Some((event, size)) = read_frame(&mut input)? {
            events.push(event);
            intact += size;
        }
        Ok((events, intact))
    }
}
