//! Write-ahead journal for the objectfs engine
//!
//! The journal is a preallocated file of fixed size. Entries are appended in
//! submission order by a dedicated writer thread; once a batch is on stable
//! storage each entry's durability callback fires, again in submission
//! order. The committed window is trimmed with [`Journal::committed_thru`]
//! after every filesystem commit cycle.
//!
//! Record format:
//! ```text
//! +--------+------+--------+--------+------+--------+
//! | Magic  | Kind | Seq    | Length | Data | CRC32C |
//! | 4B     | 1B   | 8B     | 4B     | var  | 4B     |
//! +--------+------+--------+--------+------+--------+
//! ```
//! Every record is padded to a 4 KiB boundary so torn tails never straddle a
//! record and direct I/O stays aligned.

use objectfs_common::{Error, JournalConfig, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, trace};

/// Journal record magic number
const RECORD_MAGIC: u32 = 0x4A524543; // "JREC"

/// Journal header magic number
const HEADER_MAGIC: u32 = 0x4A484452; // "JHDR"

/// Header zone size, one aligned block
const HEADER_SIZE: u64 = BLOCK;

/// Record and header alignment
const BLOCK: u64 = 4096;

/// Fixed part of a record: magic + kind + seq + length
const RECORD_HEADER_SIZE: usize = 17;

/// Callback fired once a record is on stable storage
pub type DurableCallback = Box<dyn FnOnce() + Send + 'static>;

/// Page-aligned staging buffer for direct I/O. Records are already padded
/// to whole blocks; only the memory address needs aligning.
struct AlignedBuf {
    raw: Vec<u8>,
    start: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(capacity: usize) -> Self {
        let raw = vec![0u8; capacity + BLOCK as usize];
        let start = raw.as_ptr().align_offset(BLOCK as usize);
        Self {
            raw,
            start,
            len: 0,
        }
    }

    fn fill(&mut self, data: &[u8]) {
        if data.len() + BLOCK as usize > self.raw.len() {
            self.raw = vec![0u8; data.len() + BLOCK as usize];
            self.start = self.raw.as_ptr().align_offset(BLOCK as usize);
        }
        self.raw[self.start..self.start + data.len()].copy_from_slice(data);
        self.len = data.len();
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.start..self.start + self.len]
    }
}

/// Record kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// A transaction batch
    Entry = 1,
    /// A batched completion marker listing acked sequences
    Ack = 2,
}

impl RecordKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Entry),
            2 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// An entry recovered during replay
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub seq: u64,
    pub payload: Vec<u8>,
}

/// On-disk journal header
#[derive(Debug, Clone)]
struct Header {
    fsid: [u8; 16],
    /// Offset of the oldest live record
    start_offset: u64,
    /// Offset one past the newest record
    write_offset: u64,
    /// Highest sequence known committed to the backing filesystem
    committed_seq: u64,
}

impl Header {
    const ENCODED_LEN: usize = 4 + 4 + 16 + 8 + 8 + 8 + 4;

    fn new(fsid: [u8; 16]) -> Self {
        Self {
            fsid,
            start_offset: HEADER_SIZE,
            write_offset: HEADER_SIZE,
            committed_seq: 0,
        }
    }

    fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        buf[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
        buf[8..24].copy_from_slice(&self.fsid);
        buf[24..32].copy_from_slice(&self.start_offset.to_le_bytes());
        buf[32..40].copy_from_slice(&self.write_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.committed_seq.to_le_bytes());
        let crc = crc32c::crc32c(&buf[..Self::ENCODED_LEN - 4]);
        buf[Self::ENCODED_LEN - 4..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::ENCODED_LEN {
            return Err(Error::journal("journal header too small"));
        }
        let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
        if magic != HEADER_MAGIC {
            return Err(Error::journal("invalid journal header magic"));
        }
        let stored_crc = u32::from_le_bytes(
            data[Self::ENCODED_LEN - 4..Self::ENCODED_LEN].try_into().unwrap(),
        );
        let computed = crc32c::crc32c(&data[..Self::ENCODED_LEN - 4]);
        if computed != stored_crc {
            return Err(Error::ChecksumMismatch {
                expected: stored_crc,
                actual: computed,
            });
        }
        let mut fsid = [0u8; 16];
        fsid.copy_from_slice(&data[8..24]);
        Ok(Self {
            fsid,
            start_offset: u64::from_le_bytes(data[24..32].try_into().unwrap()),
            write_offset: u64::from_le_bytes(data[32..40].try_into().unwrap()),
            committed_seq: u64::from_le_bytes(data[40..48].try_into().unwrap()),
        })
    }
}

/// Serialize one record, padded to the block size
fn record_to_bytes(kind: RecordKind, seq: u64, data: &[u8]) -> Vec<u8> {
    let raw_len = RECORD_HEADER_SIZE + data.len() + 4;
    let padded = raw_len.next_multiple_of(BLOCK as usize);
    let mut buf = Vec::with_capacity(padded);
    buf.extend_from_slice(&RECORD_MAGIC.to_le_bytes());
    buf.push(kind as u8);
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&(data.len() as u32).to_le_bytes());
    buf.extend_from_slice(data);
    let crc = crc32c::crc32c(&buf);
    buf.extend_from_slice(&crc.to_le_bytes());
    buf.resize(padded, 0);
    buf
}

/// Parse one record starting at the head of `data`. Returns the record and
/// its padded on-disk length.
fn record_from_bytes(data: &[u8]) -> Result<(RecordKind, u64, Vec<u8>, usize)> {
    if data.len() < RECORD_HEADER_SIZE + 4 {
        return Err(Error::journal("journal record too small"));
    }
    let magic = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if magic != RECORD_MAGIC {
        return Err(Error::journal("invalid journal record magic"));
    }
    let kind = RecordKind::from_u8(data[4])
        .ok_or_else(|| Error::journal("invalid journal record kind"))?;
    let seq = u64::from_le_bytes(data[5..13].try_into().unwrap());
    let len = u32::from_le_bytes(data[13..17].try_into().unwrap()) as usize;
    let end = RECORD_HEADER_SIZE + len;
    if data.len() < end + 4 {
        return Err(Error::journal("journal record truncated"));
    }
    let stored_crc = u32::from_le_bytes(data[end..end + 4].try_into().unwrap());
    let computed = crc32c::crc32c(&data[..end]);
    if computed != stored_crc {
        return Err(Error::ChecksumMismatch {
            expected: stored_crc,
            actual: computed,
        });
    }
    let padded = (end + 4).next_multiple_of(BLOCK as usize);
    Ok((kind, seq, data[RECORD_HEADER_SIZE..end].to_vec(), padded))
}

struct Pending {
    offset: u64,
    bytes: Vec<u8>,
    seq: u64,
    on_durable: DurableCallback,
}

struct State {
    header: Header,
    /// Records accepted but not yet written+synced
    pending: Vec<Pending>,
    /// End offset and kind of every live record, keyed by sequence
    ends: BTreeMap<u64, (u64, RecordKind)>,
    /// Records handed to the writer but not yet durable
    in_flight: usize,
    /// Submitters currently blocked on free space
    space_waiters: usize,
    /// Entries recovered by the open-time scan, awaiting replay
    recovered: Vec<ReplayEntry>,
    stop: bool,
}

struct Inner {
    /// Buffered handle for the header block and recovery scans
    file: File,
    /// Record appends; may be opened with direct I/O
    data_file: File,
    size: u64,
    /// Tail region only ack records may use. Entries stop short of it, so
    /// the acks that release parked write-ahead ops always have room.
    ack_reserve: u64,
    /// Appends go through an aligned staging buffer
    direct: bool,
    commit_watermark: f64,
    state: Mutex<State>,
    /// Wakes the writer thread
    work_cond: Condvar,
    /// Wakes submitters blocked on free space
    space_cond: Condvar,
    /// Signalled whenever the journal goes idle (for flush)
    idle_cond: Condvar,
}

/// File-backed write-ahead journal
pub struct Journal {
    inner: Arc<Inner>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Journal {
    /// Create and preallocate a journal at `path`. Any existing content is
    /// destroyed.
    pub fn create(path: impl AsRef<Path>, fsid: [u8; 16], size: u64) -> Result<()> {
        let size = size.next_multiple_of(BLOCK).max(HEADER_SIZE + BLOCK);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(size)?;
        let header = Header::new(fsid);
        file.write_all_at(&header.to_bytes(), 0)?;
        file.sync_all()?;
        info!(path = %path.as_ref().display(), size, "created journal");
        Ok(())
    }

    /// Verify that the journal at `path` exists and belongs to `fsid`
    pub fn check(path: impl AsRef<Path>, fsid: [u8; 16]) -> Result<()> {
        let file = OpenOptions::new().read(true).open(&path)?;
        let mut buf = vec![0u8; Header::ENCODED_LEN];
        file.read_exact_at(&mut buf, 0)?;
        let header = Header::from_bytes(&buf)?;
        if header.fsid != fsid {
            return Err(Error::journal("journal fsid does not match store fsid"));
        }
        Ok(())
    }

    /// Open an existing journal. The header's write offset is only persisted
    /// on trim, so the live window is scanned to find the true tail before
    /// any new append is accepted; entries found are kept for
    /// [`Journal::replay_entries`]. The writer thread starts immediately.
    pub fn open(path: impl AsRef<Path>, fsid: [u8; 16], cfg: &JournalConfig) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let (data_file, direct) = open_journal_file(path.as_ref(), cfg)?;
        let size = file.metadata()?.len();
        let mut buf = vec![0u8; Header::ENCODED_LEN];
        file.read_exact_at(&mut buf, 0)?;
        let mut header = Header::from_bytes(&buf)?;
        if header.fsid != fsid {
            return Err(Error::journal("journal fsid does not match store fsid"));
        }

        let (recovered, ends, tail) =
            scan_live_window(&file, header.start_offset, size, header.committed_seq)?;
        header.write_offset = tail;
        debug!(
            start = header.start_offset,
            tail,
            committed = header.committed_seq,
            recovered = recovered.len(),
            "opened journal"
        );
        let ack_reserve = (size / 8).next_multiple_of(BLOCK).min(64 * BLOCK);
        let inner = Arc::new(Inner {
            file,
            data_file,
            size,
            ack_reserve,
            direct,
            commit_watermark: cfg.commit_watermark,
            state: Mutex::new(State {
                header,
                pending: Vec::new(),
                ends,
                in_flight: 0,
                space_waiters: 0,
                recovered,
                stop: false,
            }),
            work_cond: Condvar::new(),
            space_cond: Condvar::new(),
            idle_cond: Condvar::new(),
        });
        let journal = Self {
            inner: inner.clone(),
            writer: Mutex::new(None),
        };
        let handle = std::thread::Builder::new()
            .name("objectfs-journal".into())
            .spawn(move || writer_loop(&inner))
            .map_err(|e| Error::journal(format!("spawn journal writer: {e}")))?;
        *journal.writer.lock() = Some(handle);
        Ok(journal)
    }

    /// Transaction entries recovered at open whose sequence is greater than
    /// the trimmed committed sequence, in order. Ack records are skipped.
    pub fn replay_entries(&self) -> Result<Vec<ReplayEntry>> {
        Ok(self.inner.state.lock().recovered.clone())
    }

    /// Highest sequence the journal has seen (live records and trims).
    /// The submission counter must restart above this after a mount.
    #[must_use]
    pub fn last_seq(&self) -> u64 {
        let st = self.inner.state.lock();
        st.ends
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(st.header.committed_seq)
    }

    /// Queue a transaction entry for durable append. Blocks while the
    /// journal has no free space. The callback fires, in submission order,
    /// once the entry is on stable storage.
    pub fn submit_entry(
        &self,
        seq: u64,
        payload: Vec<u8>,
        on_durable: DurableCallback,
    ) -> Result<()> {
        self.submit(RecordKind::Entry, seq, payload, on_durable)
    }

    /// Queue a batched ack record covering `acked` sequences
    pub fn submit_ack(
        &self,
        seq: u64,
        acked: &[u64],
        on_durable: DurableCallback,
    ) -> Result<()> {
        let mut payload = Vec::with_capacity(8 * acked.len());
        for s in acked {
            payload.extend_from_slice(&s.to_le_bytes());
        }
        self.submit(RecordKind::Ack, seq, payload, on_durable)
    }

    fn submit(
        &self,
        kind: RecordKind,
        seq: u64,
        payload: Vec<u8>,
        on_durable: DurableCallback,
    ) -> Result<()> {
        let bytes = record_to_bytes(kind, seq, &payload);
        let need = bytes.len() as u64;
        let limit = match kind {
            RecordKind::Entry => self.inner.size - self.inner.ack_reserve,
            RecordKind::Ack => self.inner.size,
        };
        if need > limit - HEADER_SIZE {
            return Err(Error::JournalFull);
        }
        let mut st = self.inner.state.lock();
        if st.stop {
            return Err(Error::journal("journal is closed for writes"));
        }
        while st.header.write_offset + need > limit {
            trace!(seq, "journal full, waiting for trim");
            st.space_waiters += 1;
            self.inner.space_cond.wait(&mut st);
            st.space_waiters -= 1;
            if st.stop {
                return Err(Error::journal("journal is closed for writes"));
            }
        }
        let offset = st.header.write_offset;
        st.header.write_offset = offset + need;
        let write_offset = st.header.write_offset;
        st.ends.insert(seq, (write_offset, kind));
        st.pending.push(Pending {
            offset,
            bytes,
            seq,
            on_durable,
        });
        self.inner.work_cond.notify_one();
        Ok(())
    }

    /// Drop journal space for every leading record with sequence <= `seq`,
    /// plus any ack records between them (replay never reads acks). Called
    /// by the commit thread once the filesystem has caught up.
    pub fn committed_thru(&self, seq: u64) {
        let mut st = self.inner.state.lock();
        let mut changed = seq > st.header.committed_seq;
        st.header.committed_seq = st.header.committed_seq.max(seq);
        while let Some((&s, &(end, kind))) = st.ends.first_key_value() {
            if s > seq && kind != RecordKind::Ack {
                break;
            }
            st.ends.remove(&s);
            st.header.start_offset = end;
            changed = true;
        }
        if st.ends.is_empty()
            && st.pending.is_empty()
            && st.in_flight == 0
            && st.header.start_offset != HEADER_SIZE
        {
            // whole window consumed, rewind to the front
            st.header.start_offset = HEADER_SIZE;
            st.header.write_offset = HEADER_SIZE;
            changed = true;
        }
        if !changed {
            return;
        }
        let bytes = st.header.to_bytes();
        drop(st);
        if let Err(e) = self
            .inner
            .file
            .write_all_at(&bytes, 0)
            .and_then(|()| self.inner.file.sync_data())
        {
            error!(error = %e, "journal header update failed");
            std::process::abort();
        }
        self.inner.space_cond.notify_all();
    }

    /// True when the live window is past the commit watermark or a submitter
    /// is blocked on space, so the commit thread should run another cycle.
    #[must_use]
    pub fn should_commit_now(&self) -> bool {
        let st = self.inner.state.lock();
        let used = st.header.write_offset - st.header.start_offset;
        st.space_waiters > 0
            || (used as f64) > (self.inner.size as f64) * self.inner.commit_watermark
    }

    /// Block while the journal is past its fill watermark
    pub fn throttle(&self) {
        let mut st = self.inner.state.lock();
        loop {
            let used = st.header.write_offset - st.header.start_offset;
            if st.stop || (used as f64) <= (self.inner.size as f64) * 0.9 {
                return;
            }
            st.space_waiters += 1;
            self.inner.space_cond.wait(&mut st);
            st.space_waiters -= 1;
        }
    }

    /// Wait until every queued record is durable and its callback has run
    pub fn flush(&self) {
        let mut st = self.inner.state.lock();
        while !st.pending.is_empty() || st.in_flight > 0 {
            self.inner.idle_cond.wait(&mut st);
        }
    }

    /// Stop accepting writes, drain the queue and join the writer thread
    pub fn write_close(&self) {
        {
            let mut st = self.inner.state.lock();
            st.stop = true;
            self.inner.work_cond.notify_one();
            self.inner.space_cond.notify_all();
        }
        if let Some(handle) = self.writer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.write_close();
    }
}

/// Open the journal file, with direct I/O when asked for and available.
/// Asynchronous appends are accepted in configuration but this journal
/// writes synchronously from its writer thread.
fn open_journal_file(path: &Path, cfg: &JournalConfig) -> Result<(File, bool)> {
    if cfg.async_io || cfg.force_async {
        debug!("async journal appends requested; using the writer thread");
    }
    #[cfg(target_os = "linux")]
    if cfg.direct_io {
        use std::os::unix::fs::OpenOptionsExt;
        match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            Ok(file) => return Ok((file, true)),
            Err(e) => {
                tracing::warn!(error = %e, "O_DIRECT unavailable, using buffered journal I/O");
            }
        }
    }
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    Ok((file, false))
}

/// Walk records from `start` until the first invalid or non-monotone one.
/// Returns the replayable entries, the end offset of every live record keyed
/// by sequence, and the offset one past the last valid record.
fn scan_live_window(
    file: &File,
    start: u64,
    size: u64,
    committed: u64,
) -> Result<(Vec<ReplayEntry>, BTreeMap<u64, (u64, RecordKind)>, u64)> {
    let mut entries = Vec::new();
    let mut ends = BTreeMap::new();
    let mut offset = start;
    let mut last_seq = 0u64;
    let mut buf = vec![0u8; BLOCK as usize];
    while offset + BLOCK <= size {
        if file.read_exact_at(&mut buf, offset).is_err() {
            break;
        }
        // records longer than one block need a bigger read
        let (kind, seq, payload, padded) = match record_from_bytes(&buf) {
            Ok(r) => r,
            Err(Error::Journal(ref m)) if m.contains("truncated") => {
                let len = u32::from_le_bytes(buf[13..17].try_into().unwrap()) as usize;
                let want = (RECORD_HEADER_SIZE + len + 4).next_multiple_of(BLOCK as usize);
                if offset + want as u64 > size {
                    break;
                }
                let mut big = vec![0u8; want];
                if file.read_exact_at(&mut big, offset).is_err() {
                    break;
                }
                match record_from_bytes(&big) {
                    Ok(r) => r,
                    Err(_) => break,
                }
            }
            Err(_) => break, // end of valid data
        };
        if last_seq != 0 && seq <= last_seq {
            break; // wrapped into a stale tail
        }
        last_seq = seq;
        offset += padded as u64;
        ends.insert(seq, (offset, kind));
        if kind == RecordKind::Entry && seq > committed {
            entries.push(ReplayEntry { seq, payload });
        }
    }
    Ok((entries, ends, offset))
}

fn writer_loop(inner: &Arc<Inner>) {
    let mut staging = AlignedBuf::new(256 * 1024);
    loop {
        let batch = {
            let mut st = inner.state.lock();
            while st.pending.is_empty() && !st.stop {
                inner.work_cond.wait(&mut st);
            }
            if st.pending.is_empty() && st.stop {
                return;
            }
            let batch = std::mem::take(&mut st.pending);
            st.in_flight += batch.len();
            batch
        };
        trace!(records = batch.len(), "journal writer batch");
        for p in &batch {
            let r = if inner.direct {
                staging.fill(&p.bytes);
                inner.data_file.write_all_at(staging.as_slice(), p.offset)
            } else {
                inner.data_file.write_all_at(&p.bytes, p.offset)
            };
            if let Err(e) = r {
                error!(seq = p.seq, error = %e, "journal append failed");
                std::process::abort();
            }
        }
        if let Err(e) = inner.data_file.sync_data() {
            error!(error = %e, "journal sync failed");
            std::process::abort();
        }
        for p in batch {
            (p.on_durable)();
            let mut st = inner.state.lock();
            st.in_flight -= 1;
            if st.in_flight == 0 && st.pending.is_empty() {
                inner.idle_cond.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::mpsc;
    use tempfile::tempdir;

    const FSID: [u8; 16] = [7u8; 16];

    fn open_default(path: &std::path::Path) -> Journal {
        Journal::open(path, FSID, &JournalConfig::default()).unwrap()
    }

    #[test]
    fn test_create_check_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        Journal::create(&path, FSID, 1 << 20).unwrap();
        Journal::check(&path, FSID).unwrap();
        assert!(Journal::check(&path, [9u8; 16]).is_err());
        let j = open_default(&path);
        assert!(j.replay_entries().unwrap().is_empty());
    }

    #[test]
    fn test_durable_callbacks_in_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        Journal::create(&path, FSID, 4 << 20).unwrap();
        let j = open_default(&path);

        let (tx, rx) = mpsc::channel();
        for seq in 1..=20u64 {
            let tx = tx.clone();
            j.submit_entry(seq, vec![seq as u8; 100], Box::new(move || {
                tx.send(seq).unwrap();
            }))
            .unwrap();
        }
        j.flush();
        let got: Vec<u64> = rx.try_iter().collect();
        assert_eq!(got, (1..=20).collect::<Vec<_>>());
    }

    #[test]
    fn test_replay_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        Journal::create(&path, FSID, 4 << 20).unwrap();
        {
            let j = open_default(&path);
            for seq in 1..=5u64 {
                j.submit_entry(seq, format!("entry-{seq}").into_bytes(), Box::new(|| {}))
                    .unwrap();
            }
            j.submit_ack(6, &[1, 2, 3], Box::new(|| {})).unwrap();
            j.flush();
            j.write_close();
        }
        let j = open_default(&path);
        let entries = j.replay_entries().unwrap();
        // ack record is skipped, all five entries come back in order
        assert_eq!(entries.len(), 5);
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.seq, i as u64 + 1);
            assert_eq!(e.payload, format!("entry-{}", i + 1).into_bytes());
        }
    }

    #[test]
    fn test_trim_hides_committed_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        Journal::create(&path, FSID, 4 << 20).unwrap();
        {
            let j = open_default(&path);
            for seq in 1..=6u64 {
                j.submit_entry(seq, vec![0u8; 64], Box::new(|| {})).unwrap();
            }
            j.flush();
            j.committed_thru(4);
            j.write_close();
        }
        let j = open_default(&path);
        let seqs: Vec<u64> = j.replay_entries().unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![5, 6]);
    }

    #[test]
    fn test_full_journal_blocks_until_trim() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        // header + four 4K entry records, with one block of ack headroom
        Journal::create(&path, FSID, 6 * 4096).unwrap();
        let j = Arc::new(open_default(&path));
        let durable = Arc::new(AtomicU64::new(0));

        for seq in 1..=4u64 {
            let d = durable.clone();
            j.submit_entry(seq, vec![1u8; 16], Box::new(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        j.flush();
        assert!(j.should_commit_now());

        // fifth entry has no room; it must block until committed_thru frees space
        let j2 = j.clone();
        let d2 = durable.clone();
        let h = std::thread::spawn(move || {
            j2.submit_entry(5, vec![1u8; 16], Box::new(move || {
                d2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
            j2.flush();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(durable.load(Ordering::SeqCst), 4);
        j.committed_thru(4);
        h.join().unwrap();
        assert_eq!(durable.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_direct_io_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        Journal::create(&path, FSID, 1 << 20).unwrap();
        let cfg = JournalConfig {
            direct_io: true, // falls back to buffered where unsupported
            ..JournalConfig::default()
        };
        {
            let j = Journal::open(&path, FSID, &cfg).unwrap();
            j.submit_entry(1, vec![9u8; 10_000], Box::new(|| {})).unwrap();
            j.flush();
            j.write_close();
        }
        let j = open_default(&path);
        let entries = j.replay_entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payload, vec![9u8; 10_000]);
    }

    #[test]
    fn test_oversized_record_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal");
        Journal::create(&path, FSID, 64 * 1024).unwrap();
        let j = open_default(&path);
        let err = j
            .submit_entry(1, vec![0u8; 128 * 1024], Box::new(|| {}))
            .unwrap_err();
        assert!(matches!(err, Error::JournalFull));
    }
}
