use treestore::{Database, DatabaseOptions};

fn open(path: &std::path::Path) -> Database {
    DatabaseOptions::new()
        .mmap_chunk_min(64 * 1024)
        .background_checkpointer(false)
        .open(path)
        .expect("open database")
}

/// Copy-on-write frees the old version of every touched page; once the free
/// list is primed, steady-state rewrites must be served from it instead of
/// growing the file.
#[test]
fn test_rewrites_reach_a_page_plateau() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let mut db = open(&dir.path().join("t.db"));

    for i in 0..200u32 {
        db.set(format!("key{:03}", i).as_bytes(), b"initial-value")?;
    }

    // Warm up: the first rewrites still allocate while the recycler fills.
    for round in 0..5u32 {
        for i in 0..200u32 {
            let value = format!("value-{}-{}", round, i);
            db.set(format!("key{:03}", i).as_bytes(), value.as_bytes())?;
        }
    }
    let after_warmup = db.flushed_pages();

    for round in 5..15u32 {
        for i in 0..200u32 {
            let value = format!("value-{}-{}", round, i);
            db.set(format!("key{:03}", i).as_bytes(), value.as_bytes())?;
        }
    }
    let after_churn = db.flushed_pages();

    let growth = after_churn - after_warmup;
    assert!(
        growth <= 40,
        "file kept growing under rewrite churn: {} -> {} pages",
        after_warmup,
        after_churn
    );

    // The data is still all there.
    for i in 0..200u32 {
        let expected = format!("value-14-{}", i);
        assert_eq!(
            db.get(format!("key{:03}", i).as_bytes())?,
            Some(expected.into_bytes())
        );
    }
    Ok(())
}

/// Pages freed inside a transaction must not be handed back to that same
/// transaction: an aborted transaction leaves previously committed pages
/// untouched.
#[test]
fn test_aborted_transaction_preserves_committed_pages() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let mut db = open(&dir.path().join("t.db"));

    for i in 0..100u32 {
        db.set(format!("key{:03}", i).as_bytes(), b"committed")?;
    }

    // Heavy churn inside one transaction, then abort.
    {
        let mut tx = db.begin();
        for round in 0..5u32 {
            for i in 0..100u32 {
                let value = format!("scratch-{}-{}", round, i);
                tx.set(format!("key{:03}", i).as_bytes(), value.as_bytes())?;
            }
        }
        tx.abort();
    }

    for i in 0..100u32 {
        assert_eq!(
            db.get(format!("key{:03}", i).as_bytes())?,
            Some(b"committed".to_vec()),
            "key{:03} corrupted by aborted churn",
            i
        );
    }
    Ok(())
}

#[test]
fn test_delete_heavy_workload_reuses_pages() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::TempDir::new()?;
    let path = dir.path().join("t.db");
    let mut db = open(&path);

    let value = vec![0x11u8; 500];
    for cycle in 0..10u32 {
        for i in 0..100u32 {
            db.set(format!("cycle-{}-{:03}", cycle, i).as_bytes(), &value)?;
        }
        for i in 0..100u32 {
            assert!(db.del(format!("cycle-{}-{:03}", cycle, i).as_bytes())?);
        }
    }
    let pages = db.flushed_pages();
    db.close();

    // Ten insert/delete cycles of ~15 pages of payload each settle far
    // below the no-reuse worst case.
    assert!(pages < 400, "no page reuse: {} pages flushed", pages);

    let db = open(&path);
    let mut remaining = 0;
    db.scan(b"", |_, _| {
        remaining += 1;
        true
    })?;
    assert_eq!(remaining, 0);
    Ok(())
}
