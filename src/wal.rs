use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Length prefix plus checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Append-only log of every catalog, calendar and appointment event of one business.
///
/// Frame layout: `[u32 le payload len][bincode Event][u32 le crc32(payload)]`.
/// Events are staged into a buffer and made durable together by `commit`, which is
/// how the engine's writer task gets group commit. A torn or corrupt tail left by a
/// crash ends replay at the last good frame.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    snapshot_path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open the log for appending and return the events it already holds.
    ///
    /// Anything past the last good frame is cut off first, so new frames land
    /// where the next replay will reach them.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let (events, good_len) = recover(path)?;
        if let Ok(meta) = fs::metadata(path)
            && meta.len() > good_len
        {
            tracing::warn!(
                "WAL {}: dropping {} bytes after the last good frame",
                path.display(),
                meta.len() - good_len
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        let wal = Self {
            writer: append_writer(path)?,
            path: path.to_path_buf(),
            snapshot_path: path.with_extension("wal.snapshot"),
            appends_since_compact: 0,
        };
        Ok((wal, events))
    }

    /// Buffer one event. Not durable until `commit`.
    pub fn stage(&mut self, event: &Event) -> io::Result<()> {
        write_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush staged events and fsync.
    pub fn commit(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.stage(event)?;
        self.commit()
    }

    /// Write `events` to the snapshot file next to the log and fsync it.
    /// The live log is untouched until `install_snapshot`.
    pub fn write_snapshot(&self, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(&self.snapshot_path)?);
        for event in events {
            write_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the snapshot over the log and continue appending to it.
    pub fn install_snapshot(&mut self) -> io::Result<()> {
        self.commit()?;
        fs::rename(&self.snapshot_path, &self.path)?;
        self.writer = append_writer(&self.path)?;
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the log with `events`.
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        self.write_snapshot(events)?;
        self.install_snapshot()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Every event up to the first torn or corrupt frame. A missing file is an empty log.
    #[cfg(test)]
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Ok(recover(path)?.0)
    }
}

/// The readable events of a log and the byte length of the prefix holding them.
fn recover(path: &Path) -> io::Result<(Vec<Event>, u64)> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
        Err(e) => return Err(e),
    };

    let mut events = Vec::new();
    let mut good_len = 0u64;
    for payload in Frames::new(BufReader::new(file)) {
        let payload = payload?;
        let Ok(event) = bincode::deserialize::<Event>(&payload) else {
            break;
        };
        good_len += FRAME_OVERHEAD + payload.len() as u64;
        events.push(event);
    }
    tracing::trace!("WAL {} holds {} events", path.display(), events.len());
    Ok((events, good_len))
}

fn append_writer(path: &Path) -> io::Result<BufWriter<File>> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

fn write_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

/// Verified frame payloads. Ends quietly at a clean EOF, a short read or a bad checksum;
/// only real I/O errors are yielded as `Err`.
struct Frames<R> {
    reader: R,
    done: bool,
}

impl<R: Read> Frames<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            done: false,
        }
    }

    fn next_frame(&mut self) -> io::Result<Option<Vec<u8>>> {
        let Some(len) = self.read_u32()? else {
            return Ok(None);
        };
        let mut payload = vec![0u8; len as usize];
        if !fill(&mut self.reader, &mut payload)? {
            return Ok(None);
        }
        match self.read_u32()? {
            Some(crc) if crc == crc32fast::hash(&payload) => Ok(Some(payload)),
            _ => Ok(None),
        }
    }

    fn read_u32(&mut self) -> io::Result<Option<u32>> {
        let mut buf = [0u8; 4];
        Ok(fill(&mut self.reader, &mut buf)?.then(|| u32::from_le_bytes(buf)))
    }
}

impl<R: Read> Iterator for Frames<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let frame = self.next_frame().transpose();
        if !matches!(frame, Some(Ok(_))) {
            self.done = true;
        }
        frame
    }
}

/// `read_exact` that reports a short read as `false` instead of an error.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}
