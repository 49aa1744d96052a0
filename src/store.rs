//! Persistent band store
//!
//! Two append-only streams: the command stream holds instruction runs back
//! to back, the block index holds one 16 byte [`BlockRecord`] per run and
//! ends each page with a sentinel. A band's commands are every run whose
//! record covers it, in index order.

use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, trace};

use crate::error::Result;
use crate::state::BandRange;

/// Stream usable as either half of a band store
pub trait StoreStream: Read + Write + Seek {
    /// Discard the contents and rewind
    fn truncate(&mut self) -> io::Result<()>;
}

impl StoreStream for Cursor<Vec<u8>> {
    fn truncate(&mut self) -> io::Result<()> {
        self.get_mut().clear();
        self.set_position(0);
        Ok(())
    }
}

impl StoreStream for File {
    fn truncate(&mut self) -> io::Result<()> {
        self.set_len(0)?;
        self.seek(SeekFrom::Start(0))?;
        Ok(())
    }
}

/// Index entry for one instruction run
#[derive(Debug,Copy,Clone,PartialEq,Eq)]
pub struct BlockRecord {
    pub band_min: i32,
    pub band_max: i32,
    /// Start of the run in the command stream
    pub offset: i64,
}

impl BlockRecord {
    pub const SIZE: usize = 16;

    pub fn new(range: BandRange, offset: u64) -> Self {
        Self { band_min: range.min as i32, band_max: range.max as i32, offset: offset as i64 }
    }
    /// End of page marker
    pub fn sentinel(offset: u64) -> Self {
        Self { band_min: -1, band_max: -1, offset: offset as i64 }
    }
    pub fn is_sentinel(&self) -> bool {
        self.band_min == -1 && self.band_max == -1
    }
    pub fn applies_to(&self, band: usize) -> bool {
        !self.is_sentinel() && self.band_min as i64 <= band as i64 && band as i64 <= self.band_max as i64
    }
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut b = [0u8; Self::SIZE];
        b[0..4].copy_from_slice(&self.band_min.to_le_bytes());
        b[4..8].copy_from_slice(&self.band_max.to_le_bytes());
        b[8..16].copy_from_slice(&self.offset.to_le_bytes());
        b
    }
    pub fn from_bytes(b: &[u8; Self::SIZE]) -> Self {
        let mut i = [0u8; 4];
        let mut o = [0u8; 8];
        i.copy_from_slice(&b[0..4]);
        let band_min = i32::from_le_bytes(i);
        i.copy_from_slice(&b[4..8]);
        let band_max = i32::from_le_bytes(i);
        o.copy_from_slice(&b[8..16]);
        Self { band_min, band_max, offset: i64::from_le_bytes(o) }
    }
}

/// Command stream plus block index
#[derive(Debug)]
pub struct BandStore<S> {
    cfile: S,
    bfile: S,
    /// Bytes in the command stream
    cend: u64,
    nrecords: u64,
}

impl BandStore<Cursor<Vec<u8>>> {
    /// Store held in memory
    pub fn memory() -> Self {
        Self::new(Cursor::new(vec![]), Cursor::new(vec![]))
    }
}

impl BandStore<File> {
    /// Store backed by two files, created or emptied
    pub fn create<P: AsRef<Path>>(cpath: P, bpath: P) -> Result<Self> {
        let open = |p: &Path| OpenOptions::new().read(true).write(true).create(true).truncate(true).open(p);
        Ok(Self::new(open(cpath.as_ref())?, open(bpath.as_ref())?))
    }
}

impl<S: StoreStream> BandStore<S> {
    pub fn new(cfile: S, bfile: S) -> Self {
        Self { cfile, bfile, cend: 0, nrecords: 0 }
    }
    /// Bytes written to the command stream
    pub fn command_len(&self) -> u64 {
        self.cend
    }
    /// Records written to the block index
    pub fn record_count(&self) -> u64 {
        self.nrecords
    }
    /// Append one instruction run terminated by `end_op`
    pub fn write_run(&mut self, range: BandRange, cmds: &[u8], end_op: u8) -> Result<()> {
        let rec = BlockRecord::new(range, self.cend);
        self.cfile.seek(SeekFrom::Start(self.cend))?;
        self.cfile.write_all(cmds)?;
        self.cfile.write_all(&[end_op])?;
        self.put_record(&rec)?;
        self.cend += cmds.len() as u64 + 1;
        trace!(min = range.min, max = range.max, len = cmds.len() + 1, "wrote run");
        Ok(())
    }
    /// Close the page
    pub fn write_sentinel(&mut self) -> Result<()> {
        let rec = BlockRecord::sentinel(self.cend);
        self.put_record(&rec)?;
        self.cfile.flush()?;
        self.bfile.flush()?;
        debug!(len = self.cend, records = self.nrecords, "page closed");
        Ok(())
    }
    fn put_record(&mut self, rec: &BlockRecord) -> Result<()> {
        self.bfile.seek(SeekFrom::Start(self.nrecords * BlockRecord::SIZE as u64))?;
        self.bfile.write_all(&rec.to_bytes())?;
        self.nrecords += 1;
        Ok(())
    }
    /// Empty both streams
    pub fn truncate(&mut self) -> Result<()> {
        self.cfile.truncate()?;
        self.bfile.truncate()?;
        debug!(len = self.cend, records = self.nrecords, "store truncated");
        self.cend = 0;
        self.nrecords = 0;
        Ok(())
    }
    fn record(&mut self, index: u64) -> Result<Option<BlockRecord>> {
        if index >= self.nrecords {
            return Ok(None);
        }
        let mut b = [0u8; BlockRecord::SIZE];
        self.bfile.seek(SeekFrom::Start(index * BlockRecord::SIZE as u64))?;
        self.bfile.read_exact(&mut b)?;
        Ok(Some(BlockRecord::from_bytes(&b)))
    }
    /// Every record in index order
    pub fn records(&mut self) -> Result<Vec<BlockRecord>> {
        let mut out = vec![];
        for i in 0 .. self.nrecords {
            if let Some(r) = self.record(i)? {
                out.push(r);
            }
        }
        Ok(out)
    }
    /// The runs of `band` as one byte stream
    pub fn band_stream(&mut self, band: usize) -> BandStream<'_, S> {
        BandStream { store: self, band, next: 0, pos: 0, end: 0, done: false }
    }
    /// Every byte of the runs for `band`
    pub fn band_bytes(&mut self, band: usize) -> Result<Vec<u8>> {
        let mut out = vec![];
        self.band_stream(band).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Forward scan over one band's runs
///
/// Stops at the page sentinel, or at the end of the index when the page
/// was never closed.
#[derive(Debug)]
pub struct BandStream<'a, S> {
    store: &'a mut BandStore<S>,
    band: usize,
    next: u64,
    pos: u64,
    end: u64,
    done: bool,
}

impl<'a, S: StoreStream> BandStream<'a, S> {
    /// Move to the next applicable run, false at the end of the page
    fn next_run(&mut self) -> Result<bool> {
        while !self.done {
            let rec = match self.store.record(self.next)? {
                Some(r) => r,
                None => {
                    self.done = true;
                    break;
                },
            };
            self.next += 1;
            if rec.is_sentinel() {
                self.done = true;
                break;
            }
            if rec.applies_to(self.band) {
                let end = match self.store.record(self.next)? {
                    Some(n) => n.offset as u64,
                    None => self.store.cend,
                };
                self.pos = rec.offset as u64;
                self.end = end;
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl<'a, S: StoreStream> Read for BandStream<'a, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos >= self.end {
            let more = self.next_run().map_err(|e| match e {
                crate::error::ClistError::Io(e) => e,
                e => io::Error::new(io::ErrorKind::Other, e.to_string()),
            })?;
            if !more {
                return Ok(0);
            }
        }
        let n = buf.len().min((self.end - self.pos) as usize);
        self.store.cfile.seek(SeekFrom::Start(self.pos))?;
        let n = self.store.cfile.read(&mut buf[.. n])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "command stream shorter than its index"));
        }
        self.pos += n as u64;
        Ok(n)
    }
}
