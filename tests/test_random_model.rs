use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use treestore::{Database, DatabaseOptions};

fn open(path: &std::path::Path) -> Database {
    DatabaseOptions::new()
        .mmap_chunk_min(64 * 1024)
        .background_checkpointer(false)
        .open(path)
        .expect("open database")
}

/// Random interleaving of sets and deletes against a reference model: a get
/// must return the value of the most recent set unless a later delete won.
#[test]
fn test_random_ops_match_reference_model() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("t.db");
    let mut db = open(&path);
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0x5EED);

    for step in 0..3000u32 {
        let key = format!("key{:03}", rng.gen_range(0..250u32)).into_bytes();
        if rng.gen_bool(0.7) {
            let value = format!("value-{}", step).into_bytes();
            db.set(&key, &value)?;
            model.insert(key, value);
        } else {
            let deleted = db.del(&key)?;
            assert_eq!(deleted, model.remove(&key).is_some());
        }

        if step % 250 == 0 {
            let probe = format!("key{:03}", rng.gen_range(0..250u32)).into_bytes();
            assert_eq!(db.get(&probe)?, model.get(&probe).cloned());
        }
    }

    // Full scan agrees with the model, in the model's (byte) order.
    let mut scanned: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    db.scan(b"", |k, v| {
        scanned.push((k.to_vec(), v.to_vec()));
        true
    })?;
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(scanned, expected);

    // And survives a reopen.
    db.close();
    let db = open(&path);
    for (key, value) in &model {
        assert_eq!(db.get(key)?.as_ref(), Some(value));
    }
    Ok(())
}

/// Random batches inside transactions, occasionally aborted: aborted
/// batches must leave no trace.
#[test]
fn test_random_transactions_with_aborts() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let mut db = open(&dir.path().join("t.db"));
    let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
    let mut rng = StdRng::seed_from_u64(0xBEE5);

    for batch in 0..60u32 {
        let mut tx = db.begin();
        let mut staged: Vec<(Vec<u8>, Option<Vec<u8>>)> = Vec::new();
        for n in 0..rng.gen_range(1..20u32) {
            let key = format!("key{:02}", rng.gen_range(0..60u32)).into_bytes();
            if rng.gen_bool(0.8) {
                let value = format!("batch-{}-{}", batch, n).into_bytes();
                tx.set(&key, &value)?;
                staged.push((key, Some(value)));
            } else {
                tx.del(&key)?;
                staged.push((key, None));
            }
        }
        if rng.gen_bool(0.3) {
            tx.abort();
        } else {
            tx.commit()?;
            for (key, value) in staged {
                match value {
                    Some(v) => {
                        model.insert(key, v);
                    }
                    None => {
                        model.remove(&key);
                    }
                }
            }
        }
    }

    let mut scanned: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
    db.scan(b"", |k, v| {
        scanned.push((k.to_vec(), v.to_vec()));
        true
    })?;
    let expected: Vec<(Vec<u8>, Vec<u8>)> =
        model.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    assert_eq!(scanned, expected);
    Ok(())
}
