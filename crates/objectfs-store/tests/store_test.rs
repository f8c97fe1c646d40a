//! End-to-end engine tests: submission, ordering, durability, replay.

use objectfs_store::{
    callback, CollectionId, Completions, FsStore, ObjectId, StoreConfig, Transaction,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

fn test_config() -> StoreConfig {
    let mut cfg = StoreConfig::default();
    cfg.sync.min_interval = 0.001;
    cfg.sync.max_interval = 0.25;
    cfg.threads.op_threads = 3;
    cfg.journal.size = 8 << 20;
    cfg
}

fn new_store(dir: &TempDir, cfg: StoreConfig) -> FsStore {
    let store = FsStore::new(dir.path().join("store"), dir.path().join("journal"), cfg);
    store.mkfs().unwrap();
    store.mount().unwrap();
    store
}

fn reopen(dir: &TempDir, cfg: StoreConfig) -> FsStore {
    let store = FsStore::new(dir.path().join("store"), dir.path().join("journal"), cfg);
    store.mount().unwrap();
    store
}

fn cid(name: &str) -> CollectionId {
    CollectionId::new(name)
}

fn oid(name: &str) -> ObjectId {
    // deterministic hash so tests are stable across runs
    let hash = name
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));
    ObjectId::new(0, hash, name)
}

fn mkcoll(store: &FsStore, seqr: &objectfs_store::Sequencer, c: &CollectionId) {
    let mut t = Transaction::new();
    t.create_collection(c);
    store
        .queue_transactions(seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
}

#[test]
fn test_create_write_read() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("meta");
    let o = oid("obj1");

    let mut t = Transaction::new();
    t.create_collection(&c);
    t.touch(&c, &o);
    t.write(&c, &o, 0, b"hello".to_vec(), 0);

    let (tx, rx) = mpsc::channel();
    store
        .queue_transactions(
            &seqr,
            vec![t],
            Completions {
                on_readable: Some(callback(move || tx.send(()).unwrap())),
                ..Default::default()
            },
        )
        .unwrap();
    rx.recv().unwrap();

    assert_eq!(store.read(&c, &o, 0, 5).unwrap(), b"hello");
    assert_eq!(store.stat(&c, &o).unwrap(), 5);
    assert!(store.exists(&c, &o));
    store.umount().unwrap();
}

#[test]
fn test_boundary_write_semantics() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.touch(&c, &o);
    t.write(&c, &o, 0, Vec::new(), 0); // zero-length: no-op
    t.write(&c, &o, 8, b"tail".to_vec(), 0); // write past end extends
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    assert_eq!(store.stat(&c, &o).unwrap(), 12);
    // the unwritten gap reads back as zeros
    assert_eq!(store.read(&c, &o, 0, 12).unwrap(), b"\0\0\0\0\0\0\0\0tail");
    // reads past the end return only what exists
    assert_eq!(store.read(&c, &o, 8, 100).unwrap(), b"tail");

    // zero over an extent is indistinguishable from writing zeros
    let mut t = Transaction::new();
    t.zero(&c, &o, 9, 2);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(store.read(&c, &o, 8, 4).unwrap(), b"t\0\0l");

    // zero past the end extends like a write of zeros
    let mut t = Transaction::new();
    t.zero(&c, &o, 12, 4);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(store.stat(&c, &o).unwrap(), 16);
    store.umount().unwrap();
}

#[test]
fn test_truncate_and_remove() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &o, 0, b"0123456789".to_vec(), 0);
    t.truncate(&c, &o, 4);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(store.read(&c, &o, 0, 0).unwrap(), b"0123");

    let mut t = Transaction::new();
    t.remove(&c, &o);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert!(!store.exists(&c, &o));
    store.umount().unwrap();
}

#[test]
fn test_per_sequencer_ordering_under_contention() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config();
    cfg.queue.max_ops = 4; // small admission ceiling
    cfg.threads.op_threads = 4;
    let store = new_store(&dir, cfg);
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    const N: u64 = 300;
    let ondisk_order = Arc::new(Mutex::new(Vec::new()));
    let readable_order = Arc::new(Mutex::new(Vec::new()));
    for i in 0..N {
        let mut t = Transaction::new();
        t.write(&c, &o, 0, format!("{i:03}").into_bytes(), 0);
        let ondisk_order = ondisk_order.clone();
        let readable_order = readable_order.clone();
        store
            .queue_transactions(
                &seqr,
                vec![t],
                Completions {
                    on_disk: Some(callback(move || ondisk_order.lock().unwrap().push(i))),
                    on_readable: Some(callback(move || readable_order.lock().unwrap().push(i))),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    store.sync_and_flush();

    // last write wins
    assert_eq!(store.read(&c, &o, 0, 3).unwrap(), format!("{:03}", N - 1).into_bytes());
    // callbacks fired in submission order
    assert_eq!(*ondisk_order.lock().unwrap(), (0..N).collect::<Vec<_>>());
    assert_eq!(*readable_order.lock().unwrap(), (0..N).collect::<Vec<_>>());
    store.umount().unwrap();
}

#[test]
fn test_independent_sequencers_make_progress() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let setup = store.sequencer("setup");
    let c = cid("c");
    mkcoll(&store, &setup, &c);

    let done = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    let store = Arc::new(store);
    for s in 0..4 {
        let store = store.clone();
        let c = c.clone();
        let done = done.clone();
        let seqr = store.sequencer(format!("osr-{s}"));
        handles.push(std::thread::spawn(move || {
            for i in 0..50 {
                let o = oid(&format!("obj-{s}-{i}"));
                let mut t = Transaction::new();
                t.touch(&c, &o);
                t.write(&c, &o, 0, vec![s as u8; 64], 0);
                store
                    .queue_transactions(&seqr, vec![t], Completions::default())
                    .unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    store.flush();
    assert_eq!(done.load(Ordering::SeqCst), 200);
    assert_eq!(store.collection_list(&c).unwrap().len(), 200);
    store.umount().unwrap();
}

#[test]
fn test_attrs_inline_and_spilled() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config();
    cfg.xattr.max_inline_size = 16;
    cfg.xattr.max_inline_count = 2;
    let store = new_store(&dir, cfg);
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let big = vec![7u8; 100]; // over the inline limit, spills to the kv store
    let mut t = Transaction::new();
    t.touch(&c, &o);
    t.setattrs(
        &c,
        &o,
        vec![
            ("small".into(), b"v".to_vec()),
            ("large".into(), big.clone()),
        ],
    );
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    assert_eq!(store.getattr(&c, &o, "small").unwrap().as_deref(), Some(&b"v"[..]));
    assert_eq!(store.getattr(&c, &o, "large").unwrap(), Some(big.clone()));
    let all = store.getattrs(&c, &o).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["large"], big);

    // replacing a spilled attr with a small value must shadow the old copy
    let mut t = Transaction::new();
    t.setattr(&c, &o, "large", b"now-small".to_vec());
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(
        store.getattr(&c, &o, "large").unwrap().as_deref(),
        Some(&b"now-small"[..])
    );

    let mut t = Transaction::new();
    t.rmattr(&c, &o, "small");
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(store.getattr(&c, &o, "small").unwrap(), None);
    store.umount().unwrap();
}

#[test]
fn test_omap_roundtrip() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.touch(&c, &o);
    t.omap_setheader(&c, &o, b"header".to_vec());
    t.omap_setkeys(
        &c,
        &o,
        vec![
            ("k1".into(), b"v1".to_vec()),
            ("k2".into(), b"v2".to_vec()),
            ("k3".into(), b"v3".to_vec()),
        ],
    );
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    let (header, keys) = store.omap_get(&c, &o).unwrap();
    assert_eq!(header.as_deref(), Some(&b"header"[..]));
    assert_eq!(keys.len(), 3);

    // setkeys then rmkeys leaves the object without the key
    let mut t = Transaction::new();
    t.omap_rmkeys(&c, &o, vec!["k1".into()]);
    t.omap_rmkeyrange(&c, &o, "k2", "k3");
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    let (_, keys) = store.omap_get(&c, &o).unwrap();
    assert_eq!(keys.into_keys().collect::<Vec<_>>(), vec!["k3".to_string()]);
    store.umount().unwrap();
}

#[test]
fn test_clone_carries_data_attrs_omap() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let a = oid("a");
    let b = oid("b");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &a, 0, b"cloneme".to_vec(), 0);
    t.setattr(&c, &a, "u", b"v".to_vec());
    t.omap_setkeys(&c, &a, vec![("k".into(), b"w".to_vec())]);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();

    let mut t = Transaction::new();
    t.clone_object(&c, &a, &b);
    t.remove(&c, &a);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    assert!(!store.exists(&c, &a));
    assert_eq!(store.read(&c, &b, 0, 0).unwrap(), b"cloneme");
    assert_eq!(store.getattr(&c, &b, "u").unwrap().as_deref(), Some(&b"v"[..]));
    let (_, keys) = store.omap_get(&c, &b).unwrap();
    assert_eq!(keys["k"], b"w".to_vec());
    store.umount().unwrap();
}

#[test]
fn test_clone_range_copies_window() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let a = oid("a");
    let b = oid("b");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &a, 0, b"0123456789".to_vec(), 0);
    t.clone_range(&c, &a, &b, 2, 4, 1);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(store.read(&c, &b, 0, 0).unwrap(), b"\02345");
    store.umount().unwrap();
}

#[test]
fn test_collection_move_rename() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c1 = cid("c1");
    let c2 = cid("c2");
    let old = oid("old-name");
    let new = oid("new-name");
    mkcoll(&store, &seqr, &c1);
    mkcoll(&store, &seqr, &c2);

    let mut t = Transaction::new();
    t.write(&c1, &old, 0, b"payload".to_vec(), 0);
    t.omap_setkeys(&c1, &old, vec![("k".into(), b"v".to_vec())]);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();

    let mut t = Transaction::new();
    t.collection_move_rename(&c1, &old, &c2, &new);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    assert!(!store.exists(&c1, &old));
    assert_eq!(store.read(&c2, &new, 0, 0).unwrap(), b"payload");
    let (_, keys) = store.omap_get(&c2, &new).unwrap();
    assert_eq!(keys["k"], b"v".to_vec());
    store.umount().unwrap();
}

#[test]
fn test_split_collection() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("src");
    let d = cid("dst");
    mkcoll(&store, &seqr, &c);
    mkcoll(&store, &seqr, &d);

    // pseudo-random hashes from a fixed multiplier walk
    let mut hashes = Vec::new();
    let mut h = 0x9E37_79B9u32;
    for i in 0..400u32 {
        h = h.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        hashes.push((i, h));
    }
    let mut txns = Vec::new();
    for (i, h) in &hashes {
        let mut t = Transaction::new();
        t.touch(&c, &ObjectId::new(0, *h, format!("o{i}")));
        txns.push(t);
    }
    store
        .queue_transactions(&seqr, txns, Completions::default())
        .unwrap();
    store.flush();

    let mut t = Transaction::new();
    t.split_collection(&c, 2, 1, &d);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    let src_list = store.collection_list(&c).unwrap();
    let dst_list = store.collection_list(&d).unwrap();
    assert!(src_list.iter().all(|o| o.hash & 3 != 1));
    assert!(dst_list.iter().all(|o| o.hash & 3 == 1));
    assert_eq!(src_list.len() + dst_list.len(), hashes.len());
    store.umount().unwrap();
}

#[test]
fn test_flush_makes_everything_readable() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    mkcoll(&store, &seqr, &c);

    let fired = Arc::new(AtomicU64::new(0));
    for i in 0..64 {
        let o = oid(&format!("obj{i}"));
        let mut t = Transaction::new();
        t.write(&c, &o, 0, vec![i as u8; 32], 0);
        let fired = fired.clone();
        store
            .queue_transactions(
                &seqr,
                vec![t],
                Completions {
                    on_readable: Some(callback(move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    })),
                    ..Default::default()
                },
            )
            .unwrap();
    }
    store.flush();
    assert_eq!(fired.load(Ordering::SeqCst), 64);
    store.umount().unwrap();
}

#[test]
fn test_durability_across_clean_remount() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &o, 0, b"persistent".to_vec(), 0);
    t.setattr(&c, &o, "k", b"v".to_vec());
    t.omap_setkeys(&c, &o, vec![("ok".into(), b"ov".to_vec())]);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.umount().unwrap();

    let store = reopen(&dir, test_config());
    assert_eq!(store.read(&c, &o, 0, 0).unwrap(), b"persistent");
    assert_eq!(store.getattr(&c, &o, "k").unwrap().as_deref(), Some(&b"v"[..]));
    let (_, keys) = store.omap_get(&c, &o).unwrap();
    assert_eq!(keys["ok"], b"ov".to_vec());
    store.umount().unwrap();
}

#[test]
fn test_replay_after_unclean_shutdown() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let (tx, rx) = mpsc::channel();
    let mut t = Transaction::new();
    t.write(&c, &o, 0, b"ABCD".to_vec(), 0);
    store
        .queue_transactions(
            &seqr,
            vec![t],
            Completions {
                on_disk: Some(callback(move || tx.send(()).unwrap())),
                ..Default::default()
            },
        )
        .unwrap();
    // crash after the on-disk ack, before any commit cycle is guaranteed
    rx.recv().unwrap();
    store.umount_unclean().unwrap();

    let store = reopen(&dir, test_config());
    assert_eq!(store.read(&c, &o, 0, 4).unwrap(), b"ABCD");
    store.umount().unwrap();
}

#[test]
fn test_replay_is_idempotent_for_nonidempotent_ops() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let a = oid("a");
    let b = oid("b");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &a, 0, b"source".to_vec(), 0);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();

    let (tx, rx) = mpsc::channel();
    let mut t = Transaction::new();
    t.clone_object(&c, &a, &b);
    t.write(&c, &b, 6, b"+tail".to_vec(), 0);
    store
        .queue_transactions(
            &seqr,
            vec![t],
            Completions {
                on_disk: Some(callback(move || tx.send(()).unwrap())),
                ..Default::default()
            },
        )
        .unwrap();
    rx.recv().unwrap();
    store.flush();
    store.umount_unclean().unwrap();

    // two more unclean mount cycles replay the same entries repeatedly
    for _ in 0..2 {
        let store = reopen(&dir, test_config());
        assert_eq!(store.read(&c, &b, 0, 0).unwrap(), b"source+tail");
        store.umount_unclean().unwrap();
    }
    let store = reopen(&dir, test_config());
    assert_eq!(store.read(&c, &a, 0, 0).unwrap(), b"source");
    assert_eq!(store.read(&c, &b, 0, 0).unwrap(), b"source+tail");
    store.umount().unwrap();
}

#[test]
fn test_move_rename_replay_across_crashes() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c1 = cid("c1");
    let c2 = cid("c2");
    let old = oid("old");
    let new = oid("new");
    mkcoll(&store, &seqr, &c1);
    mkcoll(&store, &seqr, &c2);

    let mut t = Transaction::new();
    t.write(&c1, &old, 0, b"moving".to_vec(), 0);
    t.omap_setkeys(&c1, &old, vec![("k".into(), b"v".to_vec())]);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    let mut t = Transaction::new();
    t.collection_move_rename(&c1, &old, &c2, &new);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    store.umount_unclean().unwrap();

    // replay the move several times; the state must stay exactly moved
    for _ in 0..3 {
        let store = reopen(&dir, test_config());
        assert!(!store.exists(&c1, &old));
        assert_eq!(store.read(&c2, &new, 0, 0).unwrap(), b"moving");
        let (_, keys) = store.omap_get(&c2, &new).unwrap();
        assert_eq!(keys["k"], b"v".to_vec());
        store.umount_unclean().unwrap();
    }
    let store = reopen(&dir, test_config());
    store.umount().unwrap();
}

#[test]
fn test_committed_entries_are_not_replayed() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &o, 0, b"stable".to_vec(), 0);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.sync_and_flush();
    let committed = store.committed_seq();
    store.umount_unclean().unwrap();

    let store = reopen(&dir, test_config());
    // nothing to replay: the commit point did not move backwards
    assert!(store.committed_seq() >= committed);
    assert_eq!(store.read(&c, &o, 0, 0).unwrap(), b"stable");
    store.umount().unwrap();
}

#[test]
fn test_checkpoint_rollback_and_replay() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config();
    cfg.debug.force_copy_checkpoints = true;
    let store = new_store(&dir, cfg.clone());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &o, 0, b"first".to_vec(), 0);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.sync_and_flush(); // checkpoint taken here

    let mut t = Transaction::new();
    t.write(&c, &o, 0, b"later".to_vec(), 0);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    store.umount_unclean().unwrap();

    // mount rolls current/ back to the checkpoint, then the journal brings
    // the later write back
    let store = reopen(&dir, cfg);
    assert_eq!(store.read(&c, &o, 0, 0).unwrap(), b"later");
    store.umount().unwrap();
}

#[test]
fn test_second_mount_is_refused() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let other = FsStore::new(
        dir.path().join("store"),
        dir.path().join("journal"),
        test_config(),
    );
    assert!(matches!(
        other.mount(),
        Err(objectfs_store::Error::StoreBusy)
    ));
    store.umount().unwrap();
}

#[test]
fn test_collection_lifecycle() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("short-lived");

    let mut t = Transaction::new();
    t.create_collection(&c);
    t.collection_setattr(&c, "role", b"scratch".to_vec());
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert!(store.collection_exists(&c));
    assert!(store.collection_empty(&c).unwrap());
    assert_eq!(
        store.collection_getattr(&c, "role").unwrap().as_deref(),
        Some(&b"scratch"[..])
    );
    assert_eq!(store.list_collections().unwrap(), vec![c.clone()]);

    let mut t = Transaction::new();
    t.remove_collection(&c);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert!(!store.collection_exists(&c));
    store.umount().unwrap();
}

#[test]
fn test_pgmeta_keys_visible_and_durable() {
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("pg1-meta");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.touch(&c, &o);
    t.pgmeta_setkeys(&c, &o, vec![("epoch".into(), b"41".to_vec())]);
    t.pgmeta_setkeys(&c, &o, vec![("epoch".into(), b"42".to_vec())]);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();

    // buffered writes are merged into reads before any flush
    let (_, keys) = store.omap_get(&c, &o).unwrap();
    assert_eq!(keys["epoch"], b"42".to_vec());

    // and survive a clean remount via the commit-cycle flush
    store.umount().unwrap();
    let store = reopen(&dir, test_config());
    let (_, keys) = store.omap_get(&c, &o).unwrap();
    assert_eq!(keys["epoch"], b"42".to_vec());
    store.umount().unwrap();
}

#[test]
fn test_sloppy_crc_verifies_reads() {
    let dir = TempDir::new().unwrap();
    let mut cfg = test_config();
    cfg.debug.sloppy_crc = true;
    let store = new_store(&dir, cfg);
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let o = oid("obj");
    mkcoll(&store, &seqr, &c);

    let block = vec![3u8; 64 * 1024];
    let mut t = Transaction::new();
    t.write(&c, &o, 0, block.clone(), 0);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();
    store.flush();
    assert_eq!(store.read(&c, &o, 0, 0).unwrap(), block);
    store.umount().unwrap();
}

#[test]
fn test_wal_batch_applies_after_parallel_batch() {
    // a write-ahead batch parks its sequencer; a later parallel batch on the
    // same sequencer must not become visible first
    let dir = TempDir::new().unwrap();
    let store = new_store(&dir, test_config());
    let seqr = store.sequencer("osr");
    let c = cid("c");
    let a = oid("a");
    let b = oid("b");
    mkcoll(&store, &seqr, &c);

    let mut t = Transaction::new();
    t.write(&c, &a, 0, b"v1".to_vec(), 0);
    store
        .queue_transactions(&seqr, vec![t], Completions::default())
        .unwrap();

    // clone makes this batch write-ahead
    let mut wal = Transaction::new();
    wal.clone_object(&c, &a, &b);

    let order = Arc::new(Mutex::new(Vec::new()));
    let o1 = order.clone();
    store
        .queue_transactions(
            &seqr,
            vec![wal],
            Completions {
                on_readable: Some(callback(move || o1.lock().unwrap().push("clone"))),
                ..Default::default()
            },
        )
        .unwrap();

    let mut parallel = Transaction::new();
    parallel.write(&c, &a, 0, b"v2".to_vec(), 0);
    let o2 = order.clone();
    store
        .queue_transactions(
            &seqr,
            vec![parallel],
            Completions {
                on_readable: Some(callback(move || o2.lock().unwrap().push("write"))),
                ..Default::default()
            },
        )
        .unwrap();
    store.flush();

    assert_eq!(*order.lock().unwrap(), vec!["clone", "write"]);
    // the clone captured the pre-overwrite value
    assert_eq!(store.read(&c, &b, 0, 0).unwrap(), b"v1");
    assert_eq!(store.read(&c, &a, 0, 0).unwrap(), b"v2");
    store.umount().unwrap();
}
