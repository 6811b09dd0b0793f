#![cfg(feature = "fjall")]

use stakd_storage::fjall::FjallStore;
use stakd_storage::{Column, KeyValueStore, WriteBatch};

#[test]
fn fjall_smoke_roundtrip() {
    let dir = tempfile::tempdir().expect("tempdir");

    {
        let store = FjallStore::open(dir.path()).expect("open fjall");
        store.put(Column::Meta, b"key", b"value").expect("put");
        store.put(Column::Utxo, b"prefix:1", b"a").expect("put");
        store.put(Column::Utxo, b"prefix:2", b"b").expect("put");

        let rows = store.scan_prefix(Column::Utxo, b"prefix:").expect("scan");
        assert_eq!(rows.len(), 2);

        let mut batch = WriteBatch::new();
        batch.put(Column::Meta, b"batch", b"ok".to_vec());
        batch.delete(Column::Meta, b"key");
        store.write_batch(&batch).expect("batch commit");
        store.persist().expect("persist");
    }

    let store = FjallStore::open(dir.path()).expect("reopen fjall");
    assert!(store.get(Column::Meta, b"key").expect("get").is_none());
    assert_eq!(
        store.get(Column::Meta, b"batch").expect("get"),
        Some(b"ok".to_vec())
    );
}
