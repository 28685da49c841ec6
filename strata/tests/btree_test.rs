use std::cmp::Ordering;
use std::sync::Arc;
use std::thread;

use strata::btree::BPlusTree;
use strata::buffer_pool::BufferPoolManager;
use strata::disk::DiskManager;
use strata::transaction::Transaction;
use strata::Rid;
use tempfile::tempdir;

type Cmp = fn(&i64, &i64) -> Ordering;

fn cmp(a: &i64, b: &i64) -> Ordering {
    a.cmp(b)
}

fn rid(key: i64) -> Rid {
    Rid::new(key as i32, key as u32)
}

#[test]
fn concurrent_inserts_build_one_consistent_tree() {
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path().join("index.db")).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(64, disk, None));
    let tree = Arc::new(
        BPlusTree::new("pk", Arc::clone(&bpm), cmp as Cmp).with_node_capacity(16, 16),
    );

    const THREADS: i64 = 4;
    const PER_THREAD: i64 = 250;

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let txn = Transaction::new(t as i32 + 1);
                for key in (t * PER_THREAD)..((t + 1) * PER_THREAD) {
                    assert!(tree.insert(key, rid(key), &txn));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let txn = Transaction::new(99);
    for key in 0..THREADS * PER_THREAD {
        assert_eq!(tree.get_value(&key, Some(&txn)), Some(rid(key)));
    }
    let keys: Vec<i64> = tree.iter().map(|(key, _)| key).collect();
    assert_eq!(keys, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    assert!(bpm.check_all_unpinned());
}

#[test]
fn concurrent_readers_observe_complete_entries() {
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path().join("index.db")).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(64, disk, None));
    let tree = Arc::new(
        BPlusTree::new("pk", Arc::clone(&bpm), cmp as Cmp).with_node_capacity(16, 16),
    );

    // Seed half the key space, then race readers against a writer filling in
    // the other half.
    let txn = Transaction::new(1);
    for key in (0..1000).step_by(2) {
        assert!(tree.insert(key, rid(key), &txn));
    }

    let writer = {
        let tree = Arc::clone(&tree);
        thread::spawn(move || {
            let txn = Transaction::new(2);
            for key in (1..1000).step_by(2) {
                assert!(tree.insert(key, rid(key), &txn));
            }
        })
    };
    let readers: Vec<_> = (0..3)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let txn = Transaction::new(10 + t);
                // Seeded keys must be visible at every point in time.
                for key in (0..1000).step_by(2) {
                    assert_eq!(tree.get_value(&key, Some(&txn)), Some(rid(key)));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let txn = Transaction::new(50);
    for key in 0..1000 {
        assert_eq!(tree.get_value(&key, Some(&txn)), Some(rid(key)));
    }
}

#[test]
fn concurrent_removes_leave_survivors_intact() {
    let dir = tempdir().unwrap();
    let disk = Arc::new(DiskManager::new(dir.path().join("index.db")).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(64, disk, None));
    let tree = Arc::new(
        BPlusTree::new("pk", Arc::clone(&bpm), cmp as Cmp).with_node_capacity(16, 16),
    );

    let txn = Transaction::new(1);
    for key in 0..800 {
        assert!(tree.insert(key, rid(key), &txn));
    }

    // Each thread deletes a disjoint quarter of the even keys.
    let handles: Vec<_> = (0..4i64)
        .map(|t| {
            let tree = Arc::clone(&tree);
            thread::spawn(move || {
                let txn = Transaction::new(t as i32 + 2);
                for key in ((t * 200)..((t + 1) * 200)).filter(|k| k % 2 == 0) {
                    tree.remove(&key, &txn);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let txn = Transaction::new(77);
    for key in 0..800 {
        let expected = (key % 2 == 1).then(|| rid(key));
        assert_eq!(tree.get_value(&key, Some(&txn)), expected);
    }
    let keys: Vec<i64> = tree.iter().map(|(key, _)| key).collect();
    assert_eq!(keys, (0..800).filter(|k| k % 2 == 1).collect::<Vec<_>>());
    assert!(bpm.check_all_unpinned());
}

#[test]
fn index_survives_a_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("index.db");

    let root_before = {
        let disk = Arc::new(DiskManager::new(&path).unwrap());
        let bpm = Arc::new(BufferPoolManager::new(32, disk, None));
        let tree = BPlusTree::new("pk", Arc::clone(&bpm), cmp as Cmp).with_node_capacity(8, 8);
        let txn = Transaction::new(1);
        for key in 0..100 {
            assert!(tree.insert(key, rid(key), &txn));
        }
        bpm.flush_all_pages();
        tree.root_page_id()
    };

    let disk = Arc::new(DiskManager::new(&path).unwrap());
    let bpm = Arc::new(BufferPoolManager::new(32, disk, None));
    let tree = BPlusTree::new("pk", Arc::clone(&bpm), cmp as Cmp).with_node_capacity(8, 8);
    assert_eq!(tree.root_page_id(), root_before);

    let txn = Transaction::new(2);
    for key in 0..100 {
        assert_eq!(tree.get_value(&key, Some(&txn)), Some(rid(key)));
    }
    let keys: Vec<i64> = tree.iter().map(|(key, _)| key).collect();
    assert_eq!(keys, (0..100).collect::<Vec<_>>());
}
