//! The store engine
//!
//! `FsStore` persists objects onto a local filesystem plus a separate
//! journal file, offering atomic multi-operation transactions, crash
//! recovery by journal replay, and strict per-sequencer ordering of
//! effects.
//!
//! Write path: a transaction batch is admitted by the throttle, assigned a
//! sequence under the submission lock, appended to the journal, and queued
//! on its sequencer. Worker threads apply batches under the sequencer's
//! apply lock (write-ahead batches only after their journal ack is
//! durable). The journaled-ack thread coalesces durable entries into one
//! ack record whose durability releases on-disk callbacks. A commit thread
//! periodically forces filesystem and kv-store state to stable storage,
//! advances the committed sequence and trims the journal.

use crate::apply_manager::{ApplyManager, SubmitManager};
use crate::backend::Backend;
use crate::fd_cache::FdCache;
use crate::finisher::Finisher;
use crate::index::IndexRegistry;
use crate::omap::DbOmap;
use crate::pgmeta::PgmetaCache;
use crate::sequencer::{Callback, Op, OpSequencer, OpState, OpWorkQueue};
use crate::throttle::OpThrottle;
use crate::transaction::{encode_batch, Transaction};
use crate::watchdog::Watchdog;
use crate::wbthrottle::WbThrottle;
use fs2::FileExt as _;
use objectfs_common::{Decoder, Encoder, Error, Result, StoreConfig};
use objectfs_journal::Journal;
use parking_lot::{Condvar, Mutex};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::os::unix::fs::FileExt as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// On-disk format version of this engine
pub const STORE_VERSION: u32 = 4;

/// Feature bits the engine understands
const FEATURE_BASE_LAYOUT: u32 = 1 << 0;
const FEATURE_PGMETA_OPS: u32 = 1 << 1;
const SUPPORTED_FEATURES: u32 = FEATURE_BASE_LAYOUT | FEATURE_PGMETA_OPS;

const COMMIT_SNAP_PREFIX: &str = "snap_";
const CLUSTER_SNAP_PREFIX: &str = "clustersnap_";

/// Checkpoints retained before the oldest is destroyed
const RETAINED_SNAPS: usize = 2;

/// Handle for a named FIFO stream of operations
#[derive(Clone)]
pub struct Sequencer {
    pub(crate) inner: Arc<OpSequencer>,
}

impl Sequencer {
    /// The stream's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

/// Completion callbacks attached to a transaction batch
#[derive(Default)]
pub struct Completions {
    /// Runs on a finisher once the batch is applied (readable)
    pub on_readable: Option<Callback>,
    /// Runs inline on the applying thread right after apply
    pub on_readable_sync: Option<Callback>,
    /// Runs on a finisher once the batch is durable
    pub on_disk: Option<Callback>,
}

/// On-disk superblock: feature bits and the omap backend name
struct Superblock {
    features: u32,
    omap_backend: String,
}

impl Superblock {
    fn encode(&self) -> Vec<u8> {
        let mut e = Encoder::new();
        e.put_u32(self.features);
        e.put_str(&self.omap_backend);
        e.into_bytes()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let mut d = Decoder::new(raw);
        Ok(Self {
            features: d.get_u32()?,
            omap_backend: d.get_str()?,
        })
    }
}

pub(crate) struct JwaState {
    pub(crate) queue: Vec<Arc<Op>>,
    pub(crate) stop: bool,
}

pub(crate) struct SyncState {
    pub(crate) force: bool,
    pub(crate) stop: bool,
    pub(crate) waiters: Vec<Callback>,
}

/// State that only exists while the store is mounted
pub(crate) struct Mounted {
    pub(crate) backend: Backend,
    pub(crate) journal: Journal,
    pub(crate) omap: DbOmap,
    pub(crate) registry: IndexRegistry,
    pub(crate) op_fd: Mutex<File>,
}

pub(crate) struct Engine {
    pub(crate) config: StoreConfig,
    pub(crate) basedir: PathBuf,
    pub(crate) journal_path: PathBuf,

    pub(crate) fd_cache: FdCache,
    pub(crate) wbthrottle: WbThrottle,
    pub(crate) throttle: OpThrottle,
    pub(crate) pgmeta: PgmetaCache,
    pub(crate) apply_mgr: ApplyManager,
    pub(crate) submit_mgr: SubmitManager,
    pub(crate) work_queue: OpWorkQueue,
    pub(crate) watchdog: Watchdog,
    pub(crate) ondisk_finishers: Vec<Finisher>,
    pub(crate) apply_finishers: Vec<Finisher>,

    pub(crate) jwa: Mutex<JwaState>,
    pub(crate) jwa_cond: Condvar,
    pub(crate) sync_state: Mutex<SyncState>,
    pub(crate) sync_cond: Condvar,

    /// Ops accepted but not yet finalized, for flush()
    outstanding: Mutex<u64>,
    outstanding_cond: Condvar,

    pub(crate) replaying: AtomicBool,
    pub(crate) kill_at: AtomicU64,
    next_osr_id: AtomicUsize,

    pub(crate) mounted: Mutex<Option<Arc<Mounted>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    snaps: Mutex<Vec<u64>>,
    fsid_lock: Mutex<Option<File>>,
    pub(crate) fsid: Mutex<[u8; 16]>,
    pub(crate) dump: Mutex<Option<File>>,
}

impl Engine {
    pub(crate) fn mounted(&self) -> Result<Arc<Mounted>> {
        self.mounted
            .lock()
            .clone()
            .ok_or_else(|| Error::internal("store is not mounted"))
    }

    /// Debug failure injection: hard-exit once the countdown reaches zero
    pub(crate) fn inject_failure(&self) {
        let prev = self.kill_at.load(Ordering::Relaxed);
        if prev == 0 {
            return;
        }
        let left = self.kill_at.fetch_sub(1, Ordering::Relaxed);
        if left == 1 {
            error!("failure injection reached zero, exiting");
            std::process::exit(1);
        }
    }

    fn op_accepted(&self) {
        *self.outstanding.lock() += 1;
    }

    pub(crate) fn op_done(&self) {
        let mut n = self.outstanding.lock();
        *n -= 1;
        if *n == 0 {
            self.outstanding_cond.notify_all();
        }
    }

    fn wait_outstanding(&self) {
        let mut n = self.outstanding.lock();
        while *n > 0 {
            self.outstanding_cond.wait(&mut n);
        }
    }

    /// Finalize an op whose apply and ack have both completed
    pub(crate) fn finalize_op(&self, op: &Op) {
        op.set_state(OpState::Done);
        self.throttle.release(op.bytes);
        self.op_done();
    }
}

/// The object store engine
pub struct FsStore {
    pub(crate) engine: Arc<Engine>,
}

impl FsStore {
    /// Build an engine over `basedir` with its journal at `journal_path`.
    /// Nothing touches the disk until `mkfs` or `mount`.
    #[must_use]
    pub fn new(
        basedir: impl Into<PathBuf>,
        journal_path: impl Into<PathBuf>,
        config: StoreConfig,
    ) -> Self {
        let ondisk_finishers = (0..config.threads.ondisk_finishers.max(1))
            .map(|i| Finisher::new(format!("objectfs-ondisk-{i}")))
            .collect();
        let apply_finishers = (0..config.threads.apply_finishers.max(1))
            .map(|i| Finisher::new(format!("objectfs-apply-{i}")))
            .collect();
        let engine = Arc::new(Engine {
            fd_cache: FdCache::new(config.threads.fd_cache_shards, config.threads.fd_cache_size),
            wbthrottle: WbThrottle::new(&config.wbthrottle, config.threads.wbthrottle_shards),
            throttle: OpThrottle::new(config.queue.clone()),
            pgmeta: PgmetaCache::new(config.threads.pgmeta_shards),
            apply_mgr: ApplyManager::new(),
            submit_mgr: SubmitManager::new(),
            work_queue: OpWorkQueue::new(),
            watchdog: Watchdog::new(),
            ondisk_finishers,
            apply_finishers,
            jwa: Mutex::new(JwaState {
                queue: Vec::new(),
                stop: false,
            }),
            jwa_cond: Condvar::new(),
            sync_state: Mutex::new(SyncState {
                force: false,
                stop: false,
                waiters: Vec::new(),
            }),
            sync_cond: Condvar::new(),
            outstanding: Mutex::new(0),
            outstanding_cond: Condvar::new(),
            replaying: AtomicBool::new(false),
            kill_at: AtomicU64::new(config.debug.kill_at),
            next_osr_id: AtomicUsize::new(0),
            mounted: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            snaps: Mutex::new(Vec::new()),
            fsid_lock: Mutex::new(None),
            fsid: Mutex::new([0u8; 16]),
            dump: Mutex::new(None),
            basedir: basedir.into(),
            journal_path: journal_path.into(),
            config,
        });
        Self { engine }
    }

    /// Create a named sequencer
    #[must_use]
    pub fn sequencer(&self, name: impl Into<String>) -> Sequencer {
        let id = self.engine.next_osr_id.fetch_add(1, Ordering::Relaxed);
        Sequencer {
            inner: Arc::new(OpSequencer::new(id, name)),
        }
    }

    // ── mkfs / mkjournal ──────────────────────────────────────────────────

    /// Initialize a fresh store under `basedir` and provision the journal
    pub fn mkfs(&self) -> Result<()> {
        let eng = &self.engine;
        std::fs::create_dir_all(&eng.basedir)?;
        info!(basedir = %eng.basedir.display(), "mkfs");

        let fsid_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(eng.basedir.join("fsid"))?;
        fsid_file.try_lock_exclusive().map_err(|_| Error::StoreBusy)?;

        let fsid = match read_fsid(&fsid_file)? {
            Some(existing) => {
                info!(fsid = %Uuid::from_bytes(existing), "mkfs fsid already set");
                existing
            }
            None => {
                let fresh = *Uuid::new_v4().as_bytes();
                write_fsid(&fsid_file, fresh)?;
                info!(fsid = %Uuid::from_bytes(fresh), "mkfs generated fsid");
                fresh
            }
        };
        *eng.fsid.lock() = fsid;

        write_file_durable(
            &eng.basedir.join("store_version"),
            &STORE_VERSION.to_le_bytes(),
        )?;
        let superblock = Superblock {
            features: SUPPORTED_FEATURES,
            omap_backend: "redb".to_string(),
        };
        write_file_durable(&eng.basedir.join("superblock"), &superblock.encode())?;

        let backend = Backend::detect(&eng.basedir, eng.config.debug.force_copy_checkpoints)?;
        backend.create_current()?;

        let op_seq_path = eng.basedir.join("current/commit_op_seq");
        let op_fd = open_op_seq(&op_seq_path)?;
        let initial = read_op_seq(&op_fd)?;
        if initial == 0 {
            write_op_seq(&op_fd, 1)?;
            if backend.can_checkpoint() {
                match backend.create_checkpoint(&format!("{COMMIT_SNAP_PREFIX}1")) {
                    Ok(()) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
            }
        }
        drop(op_fd);

        DbOmap::test_init(&eng.basedir.join("current/omap"))?;
        self.mkjournal()?;

        fs2::FileExt::unlock(&fsid_file)?;
        info!(basedir = %eng.basedir.display(), "mkfs done");
        Ok(())
    }

    /// Create the journal for an existing store if it is missing or invalid
    pub fn mkjournal(&self) -> Result<()> {
        let eng = &self.engine;
        let fsid_file = File::open(eng.basedir.join("fsid"))?;
        let fsid = read_fsid(&fsid_file)?
            .ok_or_else(|| Error::Configuration("store has no fsid; run mkfs".into()))?;
        if Journal::check(&eng.journal_path, fsid).is_ok() {
            return Ok(());
        }
        Journal::create(&eng.journal_path, fsid, eng.config.journal.size)?;
        Ok(())
    }

    // ── mount / umount ────────────────────────────────────────────────────

    /// Bring the store up: lock, verify, roll back or mark, open the kv
    /// store and journal, start the machinery, replay.
    pub fn mount(&self) -> Result<()> {
        let eng = &self.engine;
        if eng.mounted.lock().is_some() {
            return Err(Error::internal("already mounted"));
        }
        info!(basedir = %eng.basedir.display(), journal = %eng.journal_path.display(), "mount");

        // 1. exclusive fsid lock
        let fsid_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(eng.basedir.join("fsid"))?;
        fsid_file.try_lock_exclusive().map_err(|_| Error::StoreBusy)?;
        let fsid = read_fsid(&fsid_file)?
            .ok_or_else(|| Error::Configuration("store has no fsid; run mkfs".into()))?;
        *eng.fsid.lock() = fsid;

        // 2. version stamp
        let on_disk_version = read_version_stamp(&eng.basedir)?;
        if on_disk_version != STORE_VERSION {
            if eng.config.update_on_mount {
                warn!(on_disk_version, "stale version stamp, updating");
                write_file_durable(
                    &eng.basedir.join("store_version"),
                    &STORE_VERSION.to_le_bytes(),
                )?;
            } else {
                return Err(Error::StaleVersion {
                    on_disk: on_disk_version,
                    wanted: STORE_VERSION,
                });
            }
        }

        // 3. superblock feature check
        let superblock = Superblock::decode(&std::fs::read(eng.basedir.join("superblock"))?)?;
        if superblock.features & !SUPPORTED_FEATURES != 0 {
            return Err(Error::IncompatibleFeatures(format!(
                "on-disk features {:#x}, supported {:#x}",
                superblock.features, SUPPORTED_FEATURES
            )));
        }
        if superblock.omap_backend != "redb" {
            return Err(Error::IncompatibleFeatures(format!(
                "unknown omap backend {:?}",
                superblock.omap_backend
            )));
        }

        // 4. backend adapter
        let backend = Backend::detect(&eng.basedir, eng.config.debug.force_copy_checkpoints)?;

        // 5. checkpoints and rollback
        self.maybe_rollback(&backend)?;

        let nosnap = eng.basedir.join("current/nosnap");
        if backend.can_checkpoint() {
            let _ = std::fs::remove_file(&nosnap);
        } else {
            // mark current/ non-snapshotted so a later checkpoint-capable
            // mount refuses to roll back over it
            File::create(&nosnap)?;
        }

        // 6. kv store
        let omap = DbOmap::open(&eng.basedir.join("current/omap"))?;

        // 7. journal
        let journal = Journal::open(&eng.journal_path, fsid, &eng.config.journal)?;

        let op_fd = open_op_seq(&eng.basedir.join("current/commit_op_seq"))?;
        let committed = read_op_seq(&op_fd)?;
        if committed == 0 {
            return Err(Error::corrupt("commit_op_seq is zero; mkfs did not finish"));
        }
        debug!(committed, "mount read committed sequence");

        // 8. per-collection index cleanup
        let registry = IndexRegistry::new(eng.basedir.join("current"));
        for cid in registry.list_collections()? {
            let idx = registry.get(&cid)?;
            let _guard = idx.lock.write();
            idx.cleanup()?;
        }

        let mounted = Arc::new(Mounted {
            backend,
            journal,
            omap,
            registry,
            op_fd: Mutex::new(op_fd),
        });
        *eng.mounted.lock() = Some(mounted.clone());

        if let Some(path) = &eng.config.debug.dump_file {
            *eng.dump.lock() = Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?,
            );
        }

        eng.submit_mgr
            .set_last_seq(mounted.journal.last_seq().max(committed));
        eng.apply_mgr.set_committed_seq(committed);

        // 9. start the machinery
        self.start_threads(&mounted);

        // 10. replay
        if let Err(e) = self.replay_journal(&mounted, committed) {
            error!(error = %e, "journal replay failed");
            self.teardown(false);
            return Err(e);
        }

        // keep the lock for the lifetime of the mount
        *eng.fsid_lock.lock() = Some(fsid_file);
        info!("mount complete");
        Ok(())
    }

    /// Enumerate checkpoints; roll `current/` back to the newest commit
    /// checkpoint (or an operator-named cluster snapshot) when the backend
    /// supports it.
    fn maybe_rollback(&self, backend: &Backend) -> Result<()> {
        let eng = &self.engine;
        let mut commit_snaps: Vec<u64> = Vec::new();
        let mut cluster_snaps: Vec<String> = Vec::new();
        for name in backend.list_checkpoints()? {
            if let Some(seq) = name.strip_prefix(COMMIT_SNAP_PREFIX) {
                if let Ok(seq) = seq.parse::<u64>() {
                    commit_snaps.push(seq);
                }
            } else if let Some(n) = name.strip_prefix(CLUSTER_SNAP_PREFIX) {
                cluster_snaps.push(n.to_string());
            }
        }
        commit_snaps.sort_unstable();
        *eng.snaps.lock() = commit_snaps.clone();

        if let Some(requested) = &eng.config.rollback_to_cluster_snap {
            if !cluster_snaps.iter().any(|s| s == requested) {
                return Err(Error::Configuration(format!(
                    "cluster snapshot {requested:?} not found"
                )));
            }
        }

        if !backend.can_checkpoint() {
            return Ok(());
        }
        if commit_snaps.is_empty() && eng.config.rollback_to_cluster_snap.is_none() {
            warn!("no checkpoints found; store may be in an inconsistent state");
            return Ok(());
        }

        let nosnap = eng.basedir.join("current/nosnap");
        if nosnap.exists() && !eng.config.use_stale_snap {
            error!("current/nosnap exists; refusing rollback that would lose new data");
            return Err(Error::NotSupported(
                "rollback over nosnap marker (set use_stale_snap to force)".into(),
            ));
        }

        let name = match &eng.config.rollback_to_cluster_snap {
            Some(n) => {
                warn!(snap = %n, "rolling back to cluster snapshot");
                format!("{CLUSTER_SNAP_PREFIX}{n}")
            }
            None => {
                let newest = *commit_snaps.last().expect("checked non-empty");
                debug!(seq = newest, "rolling back to newest commit checkpoint");
                format!("{COMMIT_SNAP_PREFIX}{newest}")
            }
        };
        backend.rollback_to(&name)?;
        Ok(())
    }

    fn start_threads(&self, mounted: &Arc<Mounted>) {
        let eng = &self.engine;
        eng.work_queue.restart();
        eng.watchdog.start();
        eng.wbthrottle.start();
        for f in &eng.ondisk_finishers {
            f.start();
        }
        for f in &eng.apply_finishers {
            f.start();
        }
        let mut threads = eng.threads.lock();
        for i in 0..eng.config.threads.op_threads.max(1) {
            let engine = self.engine.clone();
            let m = mounted.clone();
            threads.push(
                std::thread::Builder::new()
                    .name(format!("objectfs-op-{i}"))
                    .spawn(move || worker_entry(&engine, &m))
                    .expect("spawn op worker"),
            );
        }
        {
            let engine = self.engine.clone();
            let m = mounted.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("objectfs-jwa".into())
                    .spawn(move || jwa_entry(&engine, &m))
                    .expect("spawn jwa thread"),
            );
        }
        {
            let engine = self.engine.clone();
            let m = mounted.clone();
            threads.push(
                std::thread::Builder::new()
                    .name("objectfs-sync".into())
                    .spawn(move || sync_entry(&engine, &m))
                    .expect("spawn sync thread"),
            );
        }
    }

    fn replay_journal(&self, mounted: &Arc<Mounted>, committed: u64) -> Result<()> {
        let eng = &self.engine;
        let entries = mounted.journal.replay_entries()?;
        let todo: Vec<_> = entries.into_iter().filter(|e| e.seq > committed).collect();
        if todo.is_empty() {
            debug!("no journal entries to replay");
            return Ok(());
        }
        info!(count = todo.len(), "replaying journal");
        eng.replaying.store(true, Ordering::SeqCst);
        for entry in todo {
            let txns = crate::transaction::decode_batch(&entry.payload)?;
            debug!(seq = entry.seq, txns = txns.len(), "replaying entry");
            eng.apply_mgr.op_submitted(entry.seq);
            eng.apply_mgr.op_apply_start(entry.seq);
            let r = eng.do_transactions(mounted, &txns, entry.seq, 0);
            eng.apply_mgr.op_apply_finish(entry.seq);
            r?;
        }
        eng.replaying.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Clean shutdown: drain, make everything acked durable, stop threads
    /// in reverse start order, close the journal for writes, release the
    /// fsid lock.
    pub fn umount(&self) -> Result<()> {
        info!("umount");
        self.engine.mounted()?;
        self.flush();
        self.sync();
        self.teardown(true);
        Ok(())
    }

    /// Tear down without the final commit cycle. Crash simulation for
    /// kill-at harnesses and replay tests: everything not yet committed must
    /// come back through journal replay on the next mount.
    pub fn umount_unclean(&self) -> Result<()> {
        warn!("unclean umount (crash simulation)");
        self.engine.mounted()?;
        self.teardown(false);
        Ok(())
    }

    fn teardown(&self, drain: bool) {
        let eng = &self.engine;

        // stop the sync thread
        {
            let mut st = eng.sync_state.lock();
            st.stop = true;
            eng.sync_cond.notify_all();
        }
        // stop the jwa thread
        {
            let mut st = eng.jwa.lock();
            st.stop = true;
            eng.jwa_cond.notify_all();
        }
        if drain {
            eng.work_queue.drain();
        }
        eng.work_queue.stop();
        for handle in eng.threads.lock().drain(..) {
            let _ = handle.join();
        }
        eng.wbthrottle.stop();

        if let Ok(m) = eng.mounted() {
            m.journal.write_close();
        }
        for f in &eng.ondisk_finishers {
            f.stop();
        }
        for f in &eng.apply_finishers {
            f.stop();
        }
        eng.watchdog.stop();
        eng.fd_cache.clear_all();
        *eng.mounted.lock() = None;
        if let Some(f) = eng.fsid_lock.lock().take() {
            let _ = fs2::FileExt::unlock(&f);
        }
        {
            let mut st = eng.sync_state.lock();
            st.stop = false;
            st.force = false;
        }
        eng.jwa.lock().stop = false;
    }

    // ── Submission ────────────────────────────────────────────────────────

    /// Queue a transaction batch on `seqr`. Blocks on the admission
    /// throttle and the journal's fill watermark; returns once the batch is
    /// accepted and journaling has begun.
    pub fn queue_transactions(
        &self,
        seqr: &Sequencer,
        txns: Vec<Transaction>,
        completions: Completions,
    ) -> Result<()> {
        let eng = &self.engine;
        let m = eng.mounted()?;

        let bytes: u64 = txns.iter().map(Transaction::num_bytes).sum();
        let num_ops: u64 = txns.iter().map(Transaction::num_ops).sum();
        let wal = !txns.iter().all(Transaction::parallel_safe);

        eng.throttle.reserve(bytes);
        m.journal.throttle();

        let payload = encode_batch(&txns);
        let submit = eng.submit_mgr.start();
        let seq = submit.seq;

        let op = Arc::new(Op {
            seq,
            txns,
            wal,
            bytes,
            num_ops,
            state: Mutex::new(OpState::Init),
            on_readable: Mutex::new(completions.on_readable),
            on_readable_sync: Mutex::new(completions.on_readable_sync),
            on_disk: Mutex::new(completions.on_disk),
            osr: seqr.inner.clone(),
        });

        if eng.dump.lock().is_some() {
            self.dump_transactions(&op);
        }

        eng.op_accepted();
        eng.apply_mgr.op_submitted(seq);
        seqr.inner.queue(op.clone());

        let engine = self.engine.clone();
        let cb_op = op.clone();
        let submit_result = m.journal.submit_entry(
            seq,
            payload,
            Box::new(move || engine.journaled_written(&cb_op)),
        );
        drop(submit);
        if let Err(e) = submit_result {
            // a journal that cannot accept writes is fatal
            error!(seq, error = %e, "journal submission failed");
            std::process::abort();
        }

        debug!(seq, wal, bytes, ops = num_ops, osr = %seqr.inner.name, "queued transactions");
        eng.work_queue.queue(seqr.inner.clone());
        Ok(())
    }

    fn dump_transactions(&self, op: &Op) {
        let mut guard = self.engine.dump.lock();
        if let Some(f) = guard.as_mut() {
            let record = serde_json::json!({
                "seq": op.seq,
                "sequencer": op.osr.name,
                "wal": op.wal,
                "txns": op.txns,
            });
            let _ = writeln!(f, "{record}");
        }
    }

    // ── Flush / sync surface ──────────────────────────────────────────────

    /// Return once every op queued before this call has become readable
    pub fn flush(&self) {
        let eng = &self.engine;
        if let Ok(m) = eng.mounted() {
            m.journal.flush();
        }
        eng.wait_outstanding();
        for f in &eng.apply_finishers {
            f.wait_for_empty();
        }
        for f in &eng.ondisk_finishers {
            f.wait_for_empty();
        }
    }

    /// Ask the commit thread for a cycle and wait for it to finish
    pub fn sync(&self) {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        {
            let mut st = self.engine.sync_state.lock();
            st.waiters.push(Box::new(move || {
                let _ = tx.send(());
            }));
            self.engine.sync_cond.notify_all();
        }
        let _ = rx.recv();
    }

    /// Kick a commit cycle without waiting
    pub fn start_sync(&self) {
        let mut st = self.engine.sync_state.lock();
        st.force = true;
        self.engine.sync_cond.notify_all();
    }

    /// Make every queued write readable and committed to disk
    pub fn sync_and_flush(&self) {
        self.flush();
        self.sync();
    }

    /// Take a named cluster snapshot (checkpoint-capable backends only)
    pub fn snapshot(&self, name: &str) -> Result<()> {
        let m = self.engine.mounted()?;
        self.sync_and_flush();
        if !m.backend.can_checkpoint() {
            return Err(Error::NotSupported("snapshots".into()));
        }
        m.backend
            .create_checkpoint(&format!("{CLUSTER_SNAP_PREFIX}{name}"))
    }

    /// Sequence number of the last committed cycle
    #[must_use]
    pub fn committed_seq(&self) -> u64 {
        self.engine.apply_mgr.committed_seq()
    }

    /// Engine configuration snapshot
    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.engine.config
    }
}

impl Drop for FsStore {
    fn drop(&mut self) {
        if self.engine.mounted.lock().is_some() {
            let _ = self.umount();
        }
    }
}

// ── Journal completion plumbing ───────────────────────────────────────────────

impl Engine {
    /// Journal writer thread: one entry is durable. Every op joins the
    /// journaled-ack batch in entry order, which keeps per-sequencer ack
    /// order equal to sequence order.
    pub(crate) fn journaled_written(&self, op: &Arc<Op>) {
        let mut jwa = self.jwa.lock();
        let mut st = op.state.lock();
        match *st {
            OpState::Init => {
                // not yet applied (write-ahead, or a parallel op the
                // workers have not reached)
                *st = OpState::Journal;
                drop(st);
                jwa.queue.push(op.clone());
                self.jwa_cond.notify_one();
            }
            OpState::Write => {
                // parallel op already applied
                *st = OpState::Commit;
                drop(st);
                jwa.queue.push(op.clone());
                self.jwa_cond.notify_one();
            }
            other => unreachable!("journal completion in state {other:?}"),
        }
    }

    /// Journal writer thread: a batched ack record is durable. Fire on-disk
    /// callbacks in order, wake write-ahead ops, finalize parallel ops whose
    /// apply already finished.
    pub(crate) fn journaled_ack_written(&self, acks: &[Arc<Op>]) {
        for op in acks {
            let osr = op.osr.clone();
            osr.dequeue_journal(op.seq);
            if let Some(cb) = op.take_on_disk() {
                self.ondisk_finishers[osr.id % self.ondisk_finishers.len()].queue(cb);
            }
            if op.wal {
                op.set_state(OpState::Ack);
                debug!(seq = op.seq, "write-ahead op acked, scheduling apply");
                self.work_queue.queue(osr);
            } else {
                let finalize = {
                    let mut st = op.state.lock();
                    match *st {
                        OpState::Commit => {
                            *st = OpState::Ack;
                            true
                        }
                        OpState::Journal => {
                            // apply still running; the worker finalizes
                            *st = OpState::Ack;
                            false
                        }
                        other => unreachable!("ack in state {other:?}"),
                    }
                };
                if finalize {
                    self.finalize_op(op);
                }
            }
        }
    }
}

// ── Worker pool ───────────────────────────────────────────────────────────────

fn worker_entry(engine: &Arc<Engine>, m: &Arc<Mounted>) {
    let hb = engine.watchdog.register(
        "op-worker",
        Duration::from_secs_f64(engine.config.threads.op_thread_timeout),
    );
    loop {
        hb.suspend();
        let Some(osr) = engine.work_queue.dequeue() else {
            break;
        };
        hb.resume();
        do_op(engine, m, &osr, &hb);
        engine.work_queue.done();
    }
}

fn do_op(engine: &Arc<Engine>, m: &Arc<Mounted>, osr: &Arc<OpSequencer>, hb: &crate::watchdog::Heartbeat) {
    hb.suspend();
    engine
        .wbthrottle
        .throttle(osr.id % engine.wbthrottle.num_shards());
    hb.resume();

    let stall = engine.config.debug.inject_stall_secs;
    if stall > 0 {
        debug!(stall, "inject_stall sleeping");
        std::thread::sleep(Duration::from_secs(stall));
    }

    let apply_guard = osr.apply_lock.lock();
    let Some(op) = osr.peek() else {
        return; // spurious token
    };
    if !op.is_runnable() {
        // write-ahead head waiting for its ack; the ack path re-queues us
        return;
    }
    // a parallel head is unapplied by construction (applied heads get
    // popped); it may be in Init, Journal or even Ack when the journal
    // outpaced the workers
    if op.wal {
        debug_assert_eq!(op.state(), OpState::Ack);
    }

    engine.apply_mgr.op_apply_start(op.seq);
    debug!(seq = op.seq, osr = %osr.name, wal = op.wal, "applying");
    if let Err(e) = engine.do_transactions(m, &op.txns, op.seq, osr.id) {
        // the applier aborts on anything it cannot tolerate; an error here
        // is a read-side failure surfaced by configuration
        error!(seq = op.seq, error = %e, "apply failed");
        std::process::abort();
    }
    engine.apply_mgr.op_apply_finish(op.seq);

    let popped = osr.dequeue().expect("head op vanished under apply lock");
    debug_assert!(Arc::ptr_eq(&popped, &op));

    // transition under the op's state lock; see journaled_* for the peers
    let finalize = if op.wal {
        true // state Ack, ondisk already fired
    } else {
        let mut st = op.state.lock();
        match *st {
            OpState::Init => {
                *st = OpState::Write;
                false
            }
            OpState::Journal => {
                *st = OpState::Commit;
                false
            }
            OpState::Ack => true, // acked while we were applying
            other => unreachable!("apply finished in state {other:?}"),
        }
    };

    // release the apply lock before running callbacks
    let next_runnable = osr.peek().map(|n| n.is_runnable()).unwrap_or(false);
    drop(apply_guard);

    if let Some(cb) = op.take_on_readable_sync() {
        cb();
    }
    if let Some(cb) = op.take_on_readable() {
        engine.apply_finishers[osr.id % engine.apply_finishers.len()].queue(cb);
    }
    if finalize {
        engine.finalize_op(&op);
    }
    if next_runnable {
        engine.work_queue.queue(osr.clone());
    }
}

// ── Journaled-ack batching thread ─────────────────────────────────────────────

fn jwa_entry(engine: &Arc<Engine>, m: &Arc<Mounted>) {
    debug!("jwa thread start");
    loop {
        let batch = {
            let mut st = engine.jwa.lock();
            while st.queue.is_empty() && !st.stop {
                engine.jwa_cond.wait(&mut st);
            }
            if st.queue.is_empty() && st.stop {
                break;
            }
            std::mem::take(&mut st.queue)
        };
        let seqs: Vec<u64> = batch.iter().map(|o| o.seq).collect();
        let submit = engine.submit_mgr.start();
        let ack_seq = submit.seq;
        let eng = engine.clone();
        let result = m.journal.submit_ack(
            ack_seq,
            &seqs,
            Box::new(move || eng.journaled_ack_written(&batch)),
        );
        drop(submit);
        match result {
            Ok(()) => {}
            Err(e) => {
                // shutdown closed the journal under us; put nothing more in
                warn!(error = %e, "ack submission failed");
                break;
            }
        }
    }
    debug!("jwa thread end");
}

// ── Commit thread ─────────────────────────────────────────────────────────────

fn sync_entry(engine: &Arc<Engine>, m: &Arc<Mounted>) {
    let cfg = &engine.config.sync;
    let hb = engine
        .watchdog
        .register("sync", Duration::from_secs_f64(cfg.commit_timeout));
    hb.suspend();
    let max_interval = Duration::from_secs_f64(cfg.max_interval);
    let min_interval = Duration::from_secs_f64(cfg.min_interval);
    debug!("sync thread start");
    loop {
        let mut waiters = {
            let mut st = engine.sync_state.lock();
            if st.stop {
                break;
            }
            let startwait = Instant::now();
            if !st.force && st.waiters.is_empty() {
                engine.sync_cond.wait_for(&mut st, max_interval);
            }
            if st.stop {
                break;
            }
            if st.force {
                st.force = false;
            } else {
                let woke = startwait.elapsed();
                if woke < min_interval {
                    engine.sync_cond.wait_for(&mut st, min_interval - woke);
                }
            }
            std::mem::take(&mut st.waiters)
        };

        loop {
            hb.resume();
            commit_cycle(engine, m, &hb);
            hb.suspend();

            for w in waiters.drain(..) {
                w();
            }

            let mut st = engine.sync_state.lock();
            if !st.waiters.is_empty() {
                waiters = std::mem::take(&mut st.waiters);
                drop(st);
                debug!("more sync waiters, committing again");
                continue;
            }
            drop(st);
            if m.journal.should_commit_now() {
                debug!("journal near full, committing again");
                continue;
            }
            break;
        }
    }
    debug!("sync thread end");
}

fn commit_cycle(engine: &Arc<Engine>, m: &Arc<Mounted>, hb: &crate::watchdog::Heartbeat) {
    hb.reset();
    engine.work_queue.pause();
    let Some(cp) = engine.apply_mgr.commit_start() else {
        engine.work_queue.unpause();
        // still lets the journal retire leading ack records
        m.journal.committed_thru(engine.apply_mgr.committed_seq());
        return;
    };
    let start = Instant::now();

    if m.backend.can_checkpoint() {
        // the checkpoint must capture the kv store too, so flush the pgmeta
        // cache and push redb to disk while the workers are quiesced
        let kv_flush = || -> Result<()> {
            for idx in 0..engine.pgmeta.num_shards() {
                engine.pgmeta.submit_shard(idx, &m.omap)?;
            }
            m.omap.sync()?;
            write_op_seq(&m.op_fd.lock(), cp)?;
            m.op_fd.lock().sync_data()?;
            Ok(())
        };
        if let Err(e) = kv_flush() {
            error!(error = %e, "pre-checkpoint flush failed");
            std::process::abort();
        }
        let name = format!("{COMMIT_SNAP_PREFIX}{cp}");
        engine.throttle.set_committing(true);
        if let Err(e) = m.backend.create_checkpoint(&name) {
            error!(%name, error = %e, "checkpoint create failed");
            std::process::abort();
        }
        engine.snaps.lock().push(cp);
        engine.apply_mgr.commit_started();
        engine.work_queue.unpause();
        if let Err(e) = m.backend.sync_checkpoint(&name) {
            error!(%name, error = %e, "checkpoint sync failed");
            std::process::abort();
        }
        engine.throttle.set_committing(false);
    } else {
        engine.apply_mgr.commit_started();
        engine.work_queue.unpause();

        let flush_and_sync = || -> Result<()> {
            for idx in 0..engine.pgmeta.num_shards() {
                engine.pgmeta.submit_shard(idx, &m.omap)?;
            }
            m.omap.sync()?;
            m.backend.syncfs()?;
            let op_fd = m.op_fd.lock();
            write_op_seq(&op_fd, cp)?;
            op_fd.sync_data()?;
            Ok(())
        };
        if let Err(e) = flush_and_sync() {
            error!(error = %e, "commit cycle failed");
            std::process::abort();
        }
    }

    engine.apply_mgr.commit_finish();
    m.journal.committed_thru(cp);
    engine.wbthrottle.clear();

    // retire old checkpoints
    if m.backend.can_checkpoint() {
        let mut snaps = engine.snaps.lock();
        while snaps.len() > RETAINED_SNAPS {
            let old = snaps.remove(0);
            let name = format!("{COMMIT_SNAP_PREFIX}{old}");
            debug!(%name, "destroying old checkpoint");
            if let Err(e) = m.backend.destroy_checkpoint(&name) {
                warn!(%name, error = %e, "failed to destroy old checkpoint");
            }
        }
    }
    debug!(
        committed = cp,
        elapsed_ms = start.elapsed().as_millis(),
        "commit cycle done"
    );
}

// ── On-disk layout helpers ────────────────────────────────────────────────────

fn write_file_durable(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(data)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

fn read_fsid(file: &File) -> Result<Option<[u8; 16]>> {
    let mut buf = [0u8; 36];
    let n = file.read_at(&mut buf, 0)?;
    if n == 0 {
        return Ok(None);
    }
    let s = std::str::from_utf8(&buf[..n.min(36)])
        .map_err(|_| Error::corrupt("fsid is not ascii"))?;
    let uuid = Uuid::parse_str(s.trim_end()).map_err(|e| Error::corrupt(format!("fsid: {e}")))?;
    Ok(Some(*uuid.as_bytes()))
}

fn write_fsid(file: &File, fsid: [u8; 16]) -> Result<()> {
    let text = format!("{}\n", Uuid::from_bytes(fsid));
    file.set_len(0)?;
    file.write_all_at(text.as_bytes(), 0)?;
    file.sync_all()?;
    Ok(())
}

fn read_version_stamp(basedir: &Path) -> Result<u32> {
    match std::fs::read(basedir.join("store_version")) {
        Ok(raw) if raw.len() >= 4 => Ok(u32::from_le_bytes(raw[..4].try_into().unwrap())),
        Ok(_) => Ok(0),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e.into()),
    }
}

fn open_op_seq(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?)
}

fn read_op_seq(file: &File) -> Result<u64> {
    let mut buf = [0u8; 40];
    let n = file.read_at(&mut buf, 0)?;
    if n == 0 {
        return Ok(0);
    }
    let s = std::str::from_utf8(&buf[..n])
        .map_err(|_| Error::corrupt("commit_op_seq is not ascii"))?;
    s.trim_end()
        .parse::<u64>()
        .map_err(|e| Error::corrupt(format!("commit_op_seq: {e}")))
}

fn write_op_seq(file: &File, seq: u64) -> Result<()> {
    let text = format!("{seq}\n");
    file.write_all_at(text.as_bytes(), 0)?;
    file.set_len(text.len() as u64)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_op_seq_roundtrip() {
        let dir = tempdir().unwrap();
        let f = open_op_seq(&dir.path().join("commit_op_seq")).unwrap();
        assert_eq!(read_op_seq(&f).unwrap(), 0);
        write_op_seq(&f, 12345).unwrap();
        assert_eq!(read_op_seq(&f).unwrap(), 12345);
        write_op_seq(&f, 99).unwrap();
        assert_eq!(read_op_seq(&f).unwrap(), 99);
    }

    #[test]
    fn test_fsid_roundtrip() {
        let dir = tempdir().unwrap();
        let f = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.path().join("fsid"))
            .unwrap();
        assert!(read_fsid(&f).unwrap().is_none());
        let id = *Uuid::new_v4().as_bytes();
        write_fsid(&f, id).unwrap();
        assert_eq!(read_fsid(&f).unwrap(), Some(id));
    }

    #[test]
    fn test_superblock_roundtrip() {
        let sb = Superblock {
            features: SUPPORTED_FEATURES,
            omap_backend: "redb".into(),
        };
        let back = Superblock::decode(&sb.encode()).unwrap();
        assert_eq!(back.features, SUPPORTED_FEATURES);
        assert_eq!(back.omap_backend, "redb");
    }

    #[test]
    fn test_mkfs_creates_layout() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(
            dir.path().join("store"),
            dir.path().join("journal"),
            StoreConfig::default(),
        );
        store.mkfs().unwrap();
        let base = dir.path().join("store");
        assert!(base.join("fsid").is_file());
        assert!(base.join("superblock").is_file());
        assert!(base.join("store_version").is_file());
        assert!(base.join("current").is_dir());
        assert!(base.join("current/commit_op_seq").is_file());
        assert!(base.join("current/omap").is_dir());
        assert!(dir.path().join("journal").is_file());
    }

    #[test]
    fn test_mount_refuses_future_features() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(
            dir.path().join("store"),
            dir.path().join("journal"),
            StoreConfig::default(),
        );
        store.mkfs().unwrap();
        let sb = Superblock {
            features: SUPPORTED_FEATURES | (1 << 30),
            omap_backend: "redb".into(),
        };
        write_file_durable(&dir.path().join("store/superblock"), &sb.encode()).unwrap();
        assert!(matches!(
            store.mount(),
            Err(Error::IncompatibleFeatures(_))
        ));
    }

    #[test]
    fn test_mount_refuses_stale_version() {
        let dir = tempdir().unwrap();
        let store = FsStore::new(
            dir.path().join("store"),
            dir.path().join("journal"),
            StoreConfig::default(),
        );
        store.mkfs().unwrap();
        write_file_durable(&dir.path().join("store/store_version"), &2u32.to_le_bytes())
            .unwrap();
        assert!(matches!(store.mount(), Err(Error::StaleVersion { .. })));

        let mut cfg = StoreConfig::default();
        cfg.update_on_mount = true;
        let store = FsStore::new(
            dir.path().join("store"),
            dir.path().join("journal"),
            cfg,
        );
        store.mount().unwrap();
        store.umount().unwrap();
    }
}
