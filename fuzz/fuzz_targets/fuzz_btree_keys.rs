//! Fuzz target for B+ tree mutations.
//!
//! Interprets the input as a sequence of puts and deletes against one bucket,
//! mirrors them in a `BTreeMap`, and checks that the committed tree matches
//! the model and passes the consistency check.

#![no_main]

use std::collections::BTreeMap;

use libfuzzer_sys::fuzz_target;

use inkvault_store::{Database, DatabaseOptions, Error};

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let options = DatabaseOptions::builder().page_size(1024).no_sync(true).build();
    let Ok(db) = Database::open_with_options(dir.path().join("fuzz.db"), options) else {
        return;
    };

    let mut model = BTreeMap::new();
    let mut input = data;
    while !input.is_empty() {
        let batch_len = (input[0] as usize % 32 + 1).min(input.len());
        let (batch, rest) = input.split_at(batch_len);
        input = rest;

        let result = db.update(|tx| {
            let mut bucket = tx.create_bucket_if_not_exists(b"fuzz")?;
            for chunk in batch.chunks(3) {
                let key = &chunk[..1.max(chunk.len() - 1)];
                if chunk[0] % 4 == 0 {
                    bucket.delete(key)?;
                    model.remove(key);
                } else {
                    let value = vec![chunk[chunk.len() - 1]; chunk[0] as usize * 3];
                    bucket.put(key, &value)?;
                    model.insert(key.to_vec(), value);
                }
            }
            Ok::<_, Error>(())
        });
        result.expect("update");
    }

    let tx = db.begin_read().expect("read txn");
    let bucket = tx.bucket(b"fuzz").expect("bucket");
    let mut stored = Vec::new();
    bucket
        .for_each(|key, value| {
            stored.push((key.to_vec(), value.unwrap_or_default().to_vec()));
            Ok::<_, Error>(())
        })
        .expect("iterate");
    assert_eq!(stored, model.into_iter().collect::<Vec<_>>());

    let report = tx.check().expect("check");
    assert!(report.is_ok(), "{:?}", report.errors);
});
