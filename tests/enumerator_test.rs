//! Enumeration semantics: ordering, bounds, content selection, and
//! in-transaction visibility, checked against both engines.

use tempfile::tempdir;
use vellum::{
    ContentOption, Database, DatabaseConfig, DocEnumerator, EnumeratorOptions, KeyStore,
    StorageEngine, Transaction,
};

fn open_db(dir: &std::path::Path, engine: StorageEngine) -> Database {
    Database::open(
        dir.join("db"),
        &DatabaseConfig {
            create: true,
            bundled: true,
            storage_engine: Some(engine),
            ..DatabaseConfig::default()
        },
    )
    .unwrap()
}

fn for_both_engines(test: impl Fn(Database)) {
    for engine in [StorageEngine::Sqlite, StorageEngine::Forest] {
        let dir = tempdir().unwrap();
        test(open_db(dir.path(), engine));
    }
}

/// Seeds the default store with keys `b, d, a, c` (in that write order)
/// and a tombstone at `x`.
fn seed(db: &Database) -> KeyStore {
    let store = db.default_key_store().unwrap();
    let txn = Transaction::begin(db.data_file()).unwrap();
    for key in [b"b".as_slice(), b"d", b"a", b"c", b"x"] {
        let body = format!("body-{}", String::from_utf8_lossy(key));
        store.set(key, b"some-meta", body.as_bytes(), &txn).unwrap();
    }
    store.del(b"x", &txn).unwrap();
    txn.commit().unwrap();
    store
}

fn keys(enumerator: DocEnumerator) -> Vec<Vec<u8>> {
    enumerator.map(|record| record.key).collect()
}

#[test]
fn ascending_is_lexicographic() {
    for_both_engines(|db| {
        let store = seed(&db);
        let e = store.enumerate(EnumeratorOptions::default()).unwrap();
        assert_eq!(keys(e), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    });
}

#[test]
fn descending_reverses_traversal_not_bounds() {
    for_both_engines(|db| {
        let store = seed(&db);
        let e = store
            .enumerate(EnumeratorOptions {
                descending: true,
                start_key: Some(b"b".to_vec()),
                end_key: Some(b"d".to_vec()),
                ..EnumeratorOptions::default()
            })
            .unwrap();
        // Range stays [b, d); only the order flips.
        assert_eq!(keys(e), vec![b"c".to_vec(), b"b".to_vec()]);
    });
}

#[test]
fn bounds_are_half_open() {
    for_both_engines(|db| {
        let store = seed(&db);
        let e = store
            .enumerate(EnumeratorOptions {
                start_key: Some(b"a".to_vec()),
                end_key: Some(b"c".to_vec()),
                ..EnumeratorOptions::default()
            })
            .unwrap();
        assert_eq!(keys(e), vec![b"a".to_vec(), b"b".to_vec()]);
    });
}

#[test]
fn include_deleted_yields_tombstones() {
    for_both_engines(|db| {
        let store = seed(&db);
        let mut e = store
            .enumerate(EnumeratorOptions {
                include_deleted: true,
                ..EnumeratorOptions::default()
            })
            .unwrap();
        assert_eq!(e.len(), 5);

        let mut saw_tombstone = false;
        while e.advance() {
            if e.doc().key == b"x" {
                assert!(e.doc().is_deleted());
                assert!(e.doc().body.is_empty());
                saw_tombstone = true;
            }
        }
        assert!(saw_tombstone);
    });
}

#[test]
fn content_options_limit_materialization() {
    for_both_engines(|db| {
        let store = seed(&db);

        let mut meta_only = store
            .enumerate(EnumeratorOptions {
                content: ContentOption::MetaOnly,
                ..EnumeratorOptions::default()
            })
            .unwrap();
        assert!(meta_only.advance());
        assert_eq!(meta_only.doc().meta, b"some-meta");
        assert!(meta_only.doc().body.is_empty());

        let mut key_only = store
            .enumerate(EnumeratorOptions {
                content: ContentOption::KeyOnly,
                ..EnumeratorOptions::default()
            })
            .unwrap();
        assert!(key_only.advance());
        assert_eq!(key_only.doc().key, b"a");
        assert!(key_only.doc().meta.is_empty());
        assert!(key_only.doc().body.is_empty());
        assert!(key_only.doc().sequence > 0, "sequence survives key-only reads");
    });
}

#[test]
fn enumerator_in_transaction_sees_its_writes() {
    // Both engines observe the open transaction's writes from an
    // enumerator created inside it.
    for_both_engines(|db| {
        let store = seed(&db);

        let txn = Transaction::begin(db.data_file()).unwrap();
        store.set(b"pending", b"", b"uncommitted", &txn).unwrap();
        store.del(b"a", &txn).unwrap();

        let e = store.enumerate(EnumeratorOptions::default()).unwrap();
        assert_eq!(
            keys(e),
            vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec(), b"pending".to_vec()]
        );
        txn.abort().unwrap();

        // After the abort the committed view is back.
        let e = store.enumerate(EnumeratorOptions::default()).unwrap();
        assert_eq!(keys(e), vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    });
}

#[test]
fn enumerator_is_a_stable_snapshot() {
    // An enumerator created before a mutation keeps yielding the state
    // it was created against.
    for_both_engines(|db| {
        let store = seed(&db);
        let snapshot = store.enumerate(EnumeratorOptions::default()).unwrap();

        let txn = Transaction::begin(db.data_file()).unwrap();
        store.del(b"a", &txn).unwrap();
        txn.commit().unwrap();

        assert_eq!(
            keys(snapshot),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()],
            "snapshot taken before the delete still contains 'a'"
        );

        let fresh = store.enumerate(EnumeratorOptions::default()).unwrap();
        assert_eq!(keys(fresh), vec![b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    });
}

#[test]
fn empty_store_enumerates_nothing() {
    for_both_engines(|db| {
        let store = db.default_key_store().unwrap();
        let mut e = store.enumerate(EnumeratorOptions::default()).unwrap();
        assert!(e.is_empty());
        assert!(!e.advance());
    });
}
