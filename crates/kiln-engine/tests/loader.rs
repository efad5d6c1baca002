//! Bulk loading end to end.
//!
//! These tests drive the loader through the public engine API and
//! check both the table contents and the run files left on disk.

use std::cell::Cell;
use std::fs;
use std::rc::Rc;
use std::sync::atomic::Ordering;

use kiln_common::config::EngineConfig;
use kiln_common::error::KilnError;
use kiln_common::types::{Key, Value};
use kiln_engine::{Engine, Loader, LoaderOptions};
use tempfile::TempDir;

fn open_engine(tmp: &TempDir) -> Engine {
    Engine::open(EngineConfig::for_testing(tmp.path())).expect("engine should open")
}

fn key(s: &str) -> Key {
    Key::from_str(s)
}

fn val(s: &str) -> Value {
    Value::from_str(s)
}

/// Names of data-directory files containing `tag`.
fn files_containing(tmp: &TempDir, tag: &str) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(tmp.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(tag))
        .collect();
    names.sort();
    names
}

#[test]
fn test_bulk_load_round_trip() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let d1 = engine.create_table("primary").unwrap();
    let d2 = engine.create_table("secondary").unwrap();

    let txn = engine.begin();
    let mut loader =
        Loader::create(&engine, txn, None, &[d1, d2], LoaderOptions::default()).unwrap();

    let mut expected = Vec::new();
    for i in 0..1000 {
        let k = key(&format!("k{i:04}"));
        let v = val(&format!("v{i}"));
        loader.put(k.clone(), v.clone()).unwrap();
        expected.push((k, v));
    }
    assert_eq!(loader.rows_fed(), 1000);
    loader.close().unwrap();
    engine.commit(txn).unwrap();

    assert_eq!(engine.scan_committed(d1).unwrap(), expected);
    assert_eq!(engine.scan_committed(d2).unwrap(), expected);

    // One build file per destination survives the commit.
    assert_eq!(files_containing(&tmp, "-build-").len(), 2);
    let metrics = engine.metrics();
    assert_eq!(metrics.loader_closes.load(Ordering::Relaxed), 1);
    assert_eq!(metrics.loader_puts.load(Ordering::Relaxed), 1000);
}

#[test]
fn test_out_of_order_puts_load_in_key_order() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let dest = engine.create_table("dest").unwrap();

    let txn = engine.begin();
    let mut loader =
        Loader::create(&engine, txn, None, &[dest], LoaderOptions::default()).unwrap();
    for k in ["m", "a", "z", "c"] {
        loader.put(key(k), val(k)).unwrap();
    }
    loader.close().unwrap();
    engine.commit(txn).unwrap();

    let keys: Vec<Key> = engine
        .scan_committed(dest)
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![key("a"), key("c"), key("m"), key("z")]);
}

#[test]
fn test_put_failure_empties_destinations_and_reports_once() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let d1 = engine.create_table("d1").unwrap();
    let d2 = engine.create_table("d2").unwrap();

    let txn = engine.begin();
    let options = LoaderOptions {
        enforce_unique: true,
        ..LoaderOptions::default()
    };
    let mut loader = Loader::create(&engine, txn, None, &[d1, d2], options).unwrap();

    let reports = Rc::new(Cell::new(0));
    let seen = Rc::clone(&reports);
    loader.set_error_callback(Box::new(move |dest_index, error, k, _| {
        assert_eq!(dest_index, 0);
        assert!(matches!(error, KilnError::DuplicateKey { .. }));
        assert_eq!(k, &key("dup"));
        seen.set(seen.get() + 1);
    }));

    loader.put(key("dup"), val("1")).unwrap();
    let err = loader.put(key("dup"), val("2")).unwrap_err();
    assert!(matches!(err, KilnError::DuplicateKey { .. }));

    // Later puts short-circuit with the remembered failure.
    let err = loader.put(key("other"), val("3")).unwrap_err();
    assert!(matches!(err, KilnError::DuplicateKey { .. }));

    let err = loader.close().unwrap_err();
    assert!(matches!(err, KilnError::DuplicateKey { .. }));
    assert_eq!(reports.get(), 1);

    // Even committing the transaction leaves only valid empty tables.
    engine.commit(txn).unwrap();
    assert!(engine.table_is_empty(d1).unwrap());
    assert!(engine.table_is_empty(d2).unwrap());
    assert!(!files_containing(&tmp, "-empty-").is_empty());
}

#[test]
fn test_abort_then_txn_abort_restores_previous_contents() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let dest = engine.create_table("dest").unwrap();

    let setup = engine.begin();
    engine.put(setup, dest, key("kept"), val("row")).unwrap();
    engine.commit(setup).unwrap();

    let txn = engine.begin();
    let mut loader =
        Loader::create(&engine, txn, None, &[dest], LoaderOptions::default()).unwrap();
    loader.put(key("discarded"), val("row")).unwrap();
    loader.abort().unwrap();
    engine.abort(txn).unwrap();

    assert_eq!(engine.get(dest, &key("kept")).unwrap(), Some(val("row")));
    assert_eq!(engine.get(dest, &key("discarded")).unwrap(), None);
}

#[test]
fn test_check_empty_rejects_populated_destination() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let dest = engine.create_table("dest").unwrap();

    let setup = engine.begin();
    engine.put(setup, dest, key("a"), val("1")).unwrap();
    engine.commit(setup).unwrap();

    let txn = engine.begin();
    let options = LoaderOptions {
        check_empty: true,
        ..LoaderOptions::default()
    };
    let err = Loader::create(&engine, txn, None, &[dest], options).unwrap_err();
    assert!(matches!(err, KilnError::DestinationNotEmpty { .. }));

    // Nothing was disturbed; the table is still writable and intact.
    engine.abort(txn).unwrap();
    assert_eq!(engine.get(dest, &key("a")).unwrap(), Some(val("1")));
}

#[test]
fn test_no_puts_load_produces_empty_named_files() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let dest = engine.create_table("dest").unwrap();

    let setup = engine.begin();
    engine.put(setup, dest, key("old"), val("row")).unwrap();
    engine.commit(setup).unwrap();

    let txn = engine.begin();
    let loader = Loader::create(&engine, txn, None, &[dest], LoaderOptions::no_puts()).unwrap();
    loader.close().unwrap();
    engine.commit(txn).unwrap();

    assert!(engine.table_is_empty(dest).unwrap());
    assert_eq!(files_containing(&tmp, "-empty-").len(), 1);
}

#[test]
fn test_poll_cancellation_between_destinations() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let d1 = engine.create_table("d1").unwrap();
    let d2 = engine.create_table("d2").unwrap();
    let d3 = engine.create_table("d3").unwrap();

    let txn = engine.begin();
    let mut loader =
        Loader::create(&engine, txn, None, &[d1, d2, d3], LoaderOptions::default()).unwrap();
    loader.put(key("a"), val("1")).unwrap();

    let progress = Rc::new(Cell::new(0.0f32));
    let last = Rc::clone(&progress);
    loader.set_poll_function(Box::new(move |fraction| {
        last.set(fraction);
        fraction > 0.5
    }));

    let err = loader.close().unwrap_err();
    assert!(matches!(err, KilnError::Cancelled));
    assert!(progress.get() > 0.5);

    engine.commit(txn).unwrap();
    for dest in [d1, d2, d3] {
        assert!(engine.table_is_empty(dest).unwrap());
    }
}

#[test]
fn test_dropped_loader_converges_on_empty_destinations() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let dest = engine.create_table("dest").unwrap();

    let txn = engine.begin();
    let mut loader =
        Loader::create(&engine, txn, None, &[dest], LoaderOptions::default()).unwrap();
    loader.put(key("a"), val("1")).unwrap();
    drop(loader);

    engine.commit(txn).unwrap();
    assert!(engine.table_is_empty(dest).unwrap());
    assert_eq!(
        engine.metrics().loader_aborts.load(Ordering::Relaxed),
        1
    );
}

#[test]
fn test_two_loaders_cannot_share_a_destination() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&tmp);
    let dest = engine.create_table("dest").unwrap();

    let t1 = engine.begin();
    let first = Loader::create(&engine, t1, None, &[dest], LoaderOptions::default()).unwrap();

    let t2 = engine.begin();
    let err = Loader::create(&engine, t2, None, &[dest], LoaderOptions::default()).unwrap_err();
    assert!(err.is_retryable());

    first.close().unwrap();
    engine.commit(t1).unwrap();

    // The destination frees up once the first transaction resolves.
    let second = Loader::create(&engine, t2, None, &[dest], LoaderOptions::default()).unwrap();
    second.close().unwrap();
    engine.commit(t2).unwrap();
}
