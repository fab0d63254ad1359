//! Limits, error cases and ordering laws of the public API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use inkvault_store::{Database, DatabaseOptions, Error, MAX_BUCKET_NAME_SIZE, MAX_KEY_SIZE};
use inkvault_test_utils::TestDir;
use inkvault_test_utils::strategies::{Op, arb_operations};
use proptest::prelude::*;

fn open(dir: &TestDir) -> Database {
    Database::open_with_options(dir.db_path(), DatabaseOptions::builder().no_sync(true).build()).unwrap()
}

#[test]
fn empty_key_is_rejected() {
    let dir = TestDir::new();
    let db = open(&dir);
    let result = db.update(|tx| tx.create_bucket(b"b")?.put(b"", b"v"));
    assert!(matches!(result, Err(Error::KeyRequired)));
}

#[test]
fn key_size_limit_is_inclusive() {
    let dir = TestDir::new();
    let db = open(&dir);
    let largest = vec![b'k'; MAX_KEY_SIZE];
    let too_large = vec![b'k'; MAX_KEY_SIZE + 1];

    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"b")?;
        bucket.put(&largest, b"v")?;
        let err = bucket.put(&too_large, b"v").unwrap_err();
        assert!(matches!(err, Error::KeyTooLarge { len: 32769, max: 32768 }), "{err}");
        Ok::<_, Error>(())
    })
    .unwrap();

    let tx = db.begin_read().unwrap();
    assert_eq!(tx.bucket(b"b").unwrap().get(&largest).unwrap(), Some(&b"v"[..]));
}

#[test]
fn bucket_name_limits() {
    let dir = TestDir::new();
    let db = open(&dir);
    let mut tx = db.begin_write().unwrap();

    assert!(matches!(tx.create_bucket(b"").unwrap_err(), Error::BucketNameRequired));
    assert!(tx.create_bucket(&vec![b'n'; MAX_BUCKET_NAME_SIZE]).is_ok());
    assert!(matches!(
        tx.create_bucket(&vec![b'n'; MAX_BUCKET_NAME_SIZE + 1]).unwrap_err(),
        Error::BucketNameTooLarge { len: 256, max: 255 }
    ));
    assert!(matches!(
        tx.create_bucket(&vec![b'n'; MAX_BUCKET_NAME_SIZE]).unwrap_err(),
        Error::BucketExists
    ));
    tx.commit().unwrap();
}

#[test]
fn read_transaction_rejects_mutation() {
    let dir = TestDir::new();
    let db = open(&dir);
    db.update(|tx| tx.create_bucket(b"b").map(|_| ())).unwrap();

    let mut tx = db.begin_read().unwrap();
    assert!(!tx.writable());
    assert!(matches!(tx.create_bucket(b"c").unwrap_err(), Error::TxNotWritable));
    assert!(matches!(tx.bucket_mut(b"b").unwrap_err(), Error::TxNotWritable));
    assert!(matches!(tx.delete_bucket(b"b").unwrap_err(), Error::TxNotWritable));
    assert!(!tx.bucket(b"b").unwrap().writable());
    assert!(matches!(tx.commit(), Err(Error::TxNotWritable)));
}

#[test]
fn delete_of_missing_bucket_fails() {
    let dir = TestDir::new();
    let db = open(&dir);
    let result = db.update(|tx| tx.delete_bucket(b"nope"));
    assert!(matches!(result, Err(Error::BucketNotFound)));
}

#[test]
fn nested_bucket_keys_and_values_do_not_mix() {
    let dir = TestDir::new();
    let db = open(&dir);
    db.update(|tx| {
        let mut parent = tx.create_bucket(b"parent")?;
        parent.put(b"plain", b"value")?;
        parent.create_bucket(b"child")?.put(b"k", b"v")?;

        assert_eq!(parent.get(b"child")?, None);
        assert!(matches!(parent.put(b"child", b"x"), Err(Error::IncompatibleValue)));
        assert!(matches!(parent.delete(b"child"), Err(Error::IncompatibleValue)));
        assert!(matches!(parent.create_bucket(b"plain").map(|_| ()), Err(Error::IncompatibleValue)));
        assert!(matches!(parent.delete_bucket(b"plain"), Err(Error::IncompatibleValue)));
        assert!(matches!(parent.create_bucket(b"child").map(|_| ()), Err(Error::BucketExists)));
        Ok::<_, Error>(())
    })
    .unwrap();

    let tx = db.begin_read().unwrap();
    let parent = tx.bucket(b"parent").unwrap();
    assert_eq!(parent.get(b"child").unwrap(), None);
    let child = parent.bucket(b"child").unwrap().expect("child bucket");
    assert_eq!(child.get(b"k").unwrap(), Some(&b"v"[..]));
    assert!(parent.bucket(b"plain").unwrap().is_none());

    let mut cursor = parent.cursor();
    assert_eq!(cursor.first().unwrap(), Some((&b"child"[..], None)));
    assert_eq!(cursor.next().unwrap(), Some((&b"plain"[..], Some(&b"value"[..]))));
    assert_eq!(cursor.next().unwrap(), None);
}

#[test]
fn nested_changes_are_rolled_back_with_the_transaction() {
    let dir = TestDir::new();
    let db = open(&dir);
    db.update(|tx| tx.create_bucket(b"parent").map(|_| ())).unwrap();

    let mut tx = db.begin_write().unwrap();
    tx.bucket_mut(b"parent").unwrap().unwrap().create_bucket(b"child").unwrap().put(b"k", b"v").unwrap();
    tx.rollback();

    let tx = db.begin_read().unwrap();
    assert!(tx.bucket(b"parent").unwrap().bucket(b"child").unwrap().is_none());
}

#[test]
fn put_then_get_and_delete_then_get() {
    let dir = TestDir::new();
    let db = open(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"b")?;
        bucket.put(b"k", b"v1")?;
        assert_eq!(bucket.get(b"k")?, Some(&b"v1"[..]));
        bucket.put(b"k", b"v2")?;
        assert_eq!(bucket.get(b"k")?, Some(&b"v2"[..]));
        assert!(bucket.delete(b"k")?);
        assert_eq!(bucket.get(b"k")?, None);
        assert!(!bucket.delete(b"k")?);
        bucket.put(b"empty", b"")
    })
    .unwrap();

    let tx = db.begin_read().unwrap();
    let bucket = tx.bucket(b"b").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), None);
    assert_eq!(bucket.get(b"empty").unwrap(), Some(&b""[..]));
}

#[test]
fn cursor_walks_both_directions_and_seeks() {
    let dir = TestDir::new();
    let db = open(&dir);
    let keys: Vec<Vec<u8>> = (0..1000u32).map(|i| format!("key-{:04}", i * 2).into_bytes()).collect();
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"b")?;
        for key in keys.iter().rev() {
            bucket.put(key, key)?;
        }
        Ok::<_, Error>(())
    })
    .unwrap();

    let tx = db.begin_read().unwrap();
    let bucket = tx.bucket(b"b").unwrap();
    let mut cursor = bucket.cursor();

    let mut forward = Vec::new();
    let mut item = cursor.first().unwrap();
    while let Some((key, _)) = item {
        forward.push(key.to_vec());
        item = cursor.next().unwrap();
    }
    assert_eq!(forward, keys);

    let mut backward = Vec::new();
    let mut item = cursor.last().unwrap();
    while let Some((key, _)) = item {
        backward.push(key.to_vec());
        item = cursor.prev().unwrap();
    }
    backward.reverse();
    assert_eq!(backward, keys);

    assert_eq!(cursor.seek(b"key-0100").unwrap().map(|(k, _)| k), Some(&b"key-0100"[..]));
    assert_eq!(cursor.seek(b"key-0101").unwrap().map(|(k, _)| k), Some(&b"key-0102"[..]));
    assert_eq!(cursor.next().unwrap().map(|(k, _)| k), Some(&b"key-0104"[..]));
    assert_eq!(cursor.seek(b"a").unwrap().map(|(k, _)| k), Some(&b"key-0000"[..]));
    assert_eq!(cursor.seek(b"zzz").unwrap(), None);
}

#[test]
fn writer_sees_its_own_changes_through_a_cursor() {
    let dir = TestDir::new();
    let db = open(&dir);
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"b")?;
        for i in 0..300u32 {
            bucket.put(format!("{i:03}").as_bytes(), b"x")?;
        }
        Ok::<_, Error>(())
    })
    .unwrap();

    db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"b")?.ok_or(Error::BucketNotFound)?;
        for i in 0..300u32 {
            if i % 3 != 0 {
                bucket.delete(format!("{i:03}").as_bytes())?;
            }
        }
        bucket.put(b"150a", b"y")?;

        let mut cursor = bucket.cursor();
        let mut count = 0;
        let mut item = cursor.first()?;
        while let Some((key, _)) = item {
            count += 1;
            assert!(key == b"150a" || std::str::from_utf8(key).unwrap().parse::<u32>().unwrap() % 3 == 0);
            item = cursor.next()?;
        }
        assert_eq!(count, 101);
        Ok::<_, Error>(())
    })
    .unwrap();

    let report = db.check().unwrap();
    assert!(report.is_ok(), "{:?}", report.errors);
}

#[test]
fn sequence_increments_and_persists() {
    let dir = TestDir::new();
    {
        let db = open(&dir);
        db.update(|tx| {
            let mut bucket = tx.create_bucket(b"b")?;
            assert_eq!(bucket.sequence(), 0);
            assert_eq!(bucket.next_sequence()?, 1);
            assert_eq!(bucket.next_sequence()?, 2);
            let mut child = bucket.create_bucket(b"child")?;
            child.next_sequence().map(|_| ())
        })
        .unwrap();
    }

    let db = open(&dir);
    let tx = db.begin_read().unwrap();
    let bucket = tx.bucket(b"b").unwrap();
    assert_eq!(bucket.sequence(), 2);
    assert_eq!(bucket.bucket(b"child").unwrap().unwrap().sequence(), 1);
}

#[test]
fn fill_percent_is_clamped() {
    let dir = TestDir::new();
    let db = open(&dir);
    let mut tx = db.begin_write().unwrap();
    let mut bucket = tx.create_bucket(b"b").unwrap();
    bucket.set_fill_percent(5.0);
    assert!((bucket.as_bucket().fill_percent() - 1.0).abs() < f64::EPSILON);
    bucket.set_fill_percent(0.0);
    assert!((bucket.as_bucket().fill_percent() - 0.1).abs() < f64::EPSILON);
}

#[test]
fn second_writer_waits_for_the_first() {
    let dir = TestDir::new();
    let db = Arc::new(open(&dir));
    let first = db.begin_write().unwrap();
    assert!(matches!(db.try_begin_write(), Err(Error::TxInProgress)));

    let (sender, receiver) = mpsc::channel();
    let waiter = {
        let db = Arc::clone(&db);
        thread::spawn(move || {
            let tx = db.begin_write().unwrap();
            sender.send(tx.id()).unwrap();
        })
    };

    assert!(receiver.recv_timeout(Duration::from_millis(100)).is_err(), "second writer must block");
    first.commit().unwrap();
    assert_eq!(receiver.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
    waiter.join().unwrap();
}

#[test]
fn readers_keep_their_snapshot() {
    let dir = TestDir::new();
    let db = open(&dir);
    db.update(|tx| tx.create_bucket(b"b")?.put(b"k", b"old")).unwrap();

    let reader = db.begin_read().unwrap();
    db.update(|tx| {
        let mut bucket = tx.bucket_mut(b"b")?.ok_or(Error::BucketNotFound)?;
        bucket.put(b"k", b"new")?;
        bucket.put(b"k2", b"added")
    })
    .unwrap();
    db.update(|tx| tx.create_bucket(b"later").map(|_| ())).unwrap();

    let bucket = reader.bucket(b"b").unwrap();
    assert_eq!(bucket.get(b"k").unwrap(), Some(&b"old"[..]));
    assert_eq!(bucket.get(b"k2").unwrap(), None);
    assert!(reader.bucket(b"later").is_none());
    assert_eq!(reader.id() + 2, db.begin_read().unwrap().id());
}

#[test]
fn read_only_handles_share_the_file() {
    let dir = TestDir::new();
    drop(open(&dir));

    let options = DatabaseOptions::builder().read_only(true).build();
    let first = Database::open_with_options(dir.db_path(), options.clone()).unwrap();
    let second = Database::open_with_options(dir.db_path(), options).unwrap();
    assert!(first.is_read_only());
    assert!(second.begin_read().is_ok());
    assert!(matches!(Database::open(dir.db_path()), Err(Error::DatabaseAlreadyOpen)));
}

#[test]
fn deletes_keep_inner_branches_filled() {
    let dir = TestDir::new();
    let db = Database::open_with_options(
        dir.db_path(),
        DatabaseOptions::builder().page_size(1024).no_sync(true).build(),
    )
    .unwrap();
    db.update(|tx| {
        let mut bucket = tx.create_bucket(b"deep")?;
        for i in 0..5000u32 {
            bucket.put(format!("key-{i:05}").as_bytes(), &[7u8; 8])?;
        }
        Ok::<_, Error>(())
    })
    .unwrap();
    {
        let tx = db.begin_read().unwrap();
        assert!(tx.bucket(b"deep").unwrap().stats().unwrap().depth >= 3);
    }

    // Hollow the tree out in uneven bands so branches empty at different rates.
    for band in 0..10u32 {
        db.update(|tx| {
            let mut bucket = tx.bucket_mut(b"deep")?.ok_or(Error::BucketNotFound)?;
            for i in (band * 500..band * 500 + 500).filter(|i| i % 17 != 0 && i % (band + 2) != 1) {
                bucket.delete(format!("key-{i:05}").as_bytes())?;
            }
            Ok::<_, Error>(())
        })
        .unwrap();
        let report = db.check().unwrap();
        assert!(report.is_ok(), "band {band}: {:?}", report.errors);
    }

    let tx = db.begin_read().unwrap();
    let bucket = tx.bucket(b"deep").unwrap();
    let stats = bucket.stats().unwrap();
    let survivors = (0..5000u32).filter(|i| i % 17 == 0 || i % (i / 500 + 2) == 1).count();
    assert_eq!(stats.key_n, survivors);
}

fn apply(db: &Database, ops: &[Op]) -> Result<(), Error> {
    db.update(|tx| {
        let mut bucket = tx.create_bucket_if_not_exists(b"model")?;
        for op in ops {
            match op {
                Op::Put { key, value } => bucket.put(key, value)?,
                Op::Delete { key } => {
                    bucket.delete(key)?;
                }
            }
        }
        Ok(())
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn matches_an_ordered_map(ops in arb_operations(), commits in 1usize..5) {
        let dir = TestDir::new();
        let db = Database::open_with_options(
            dir.db_path(),
            DatabaseOptions::builder().page_size(1024).no_sync(true).build(),
        )
        .unwrap();

        let mut model = BTreeMap::new();
        for op in &ops {
            match op {
                Op::Put { key, value } => {
                    model.insert(key.clone(), value.clone());
                }
                Op::Delete { key } => {
                    model.remove(key);
                }
            }
        }

        let chunk = ops.len().div_ceil(commits);
        for batch in ops.chunks(chunk) {
            apply(&db, batch).unwrap();
        }

        let tx = db.begin_read().unwrap();
        let bucket = tx.bucket(b"model").unwrap();
        let mut stored = Vec::new();
        bucket
            .for_each(|key, value| {
                stored.push((key.to_vec(), value.unwrap_or_default().to_vec()));
                Ok::<_, Error>(())
            })
            .unwrap();
        let expected: Vec<_> = model.into_iter().collect();
        prop_assert_eq!(stored, expected);

        let report = tx.check().unwrap();
        prop_assert!(report.is_ok(), "{:?}", report.errors);
    }
}
