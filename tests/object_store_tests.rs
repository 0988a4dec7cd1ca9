use bytes::Bytes;
use file_lifecycle::object_store::{
    object_key, owner_prefix, LocalStore, ObjectStore, ObjectStoreError,
};

fn test_store() -> (tempfile::TempDir, LocalStore) {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    (dir, store)
}

#[tokio::test]
async fn test_local_store_put_get() {
    let (_dir, store) = test_store();

    let data = Bytes::from("hello world");
    store
        .put("alice/f1.txt", data.clone(), "text/plain")
        .await
        .unwrap();

    let retrieved = store.get("alice/f1.txt").await.unwrap();
    assert_eq!(retrieved, data);
}

#[tokio::test]
async fn test_local_store_exists() {
    let (_dir, store) = test_store();

    assert!(!store.exists("alice/missing").await.unwrap());

    store
        .put("alice/present", Bytes::from("data"), "text/plain")
        .await
        .unwrap();
    assert!(store.exists("alice/present").await.unwrap());
}

#[tokio::test]
async fn test_local_store_delete() {
    let (_dir, store) = test_store();

    store
        .put("alice/to-delete", Bytes::from("data"), "text/plain")
        .await
        .unwrap();
    store.delete("alice/to-delete").await.unwrap();
    assert!(!store.exists("alice/to-delete").await.unwrap());

    // Deleting an absent key is success
    store.delete("alice/to-delete").await.unwrap();
    store.delete("nobody/never-existed").await.unwrap();
}

#[tokio::test]
async fn test_local_store_get_not_found() {
    let (_dir, store) = test_store();

    assert!(matches!(
        store.get("alice/missing").await,
        Err(ObjectStoreError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_local_store_rejects_malformed_keys() {
    let (_dir, store) = test_store();

    for key in ["", "../escape", "alice/../../escape", "/etc/passwd", "alice//f1", "alice/"] {
        assert!(
            matches!(
                store.put(key, Bytes::from("x"), "text/plain").await,
                Err(ObjectStoreError::InvalidKey(_))
            ),
            "key {key:?} should be rejected"
        );
    }
}

#[tokio::test]
async fn test_local_store_list_by_prefix() {
    let (_dir, store) = test_store();

    for key in ["alice/b.png", "alice/a.png", "alicebob/c.png", "bob/d.png"] {
        store.put(key, Bytes::from("x"), "image/png").await.unwrap();
    }

    let keys = store.list(&owner_prefix("alice")).await.unwrap();
    assert_eq!(keys, ["alice/a.png", "alice/b.png"]);

    assert!(store.list(&owner_prefix("carol")).await.unwrap().is_empty());
    assert_eq!(store.list("").await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_local_store_list_nested_prefixes() {
    let (_dir, store) = test_store();

    for key in [
        "alice/2024/a.png",
        "alice/2024/b.png",
        "alice/2025/c.png",
        "alice/20.png",
        "bob/2024/d.png",
    ] {
        store.put(key, Bytes::from("x"), "image/png").await.unwrap();
    }

    assert_eq!(
        store.list("alice/2024/").await.unwrap(),
        ["alice/2024/a.png", "alice/2024/b.png"]
    );
    // A prefix ending mid-segment matches files and directories alike
    assert_eq!(
        store.list("alice/20").await.unwrap(),
        [
            "alice/20.png",
            "alice/2024/a.png",
            "alice/2024/b.png",
            "alice/2025/c.png"
        ]
    );
    assert!(store.list("carol/2024/").await.unwrap().is_empty());
    assert!(matches!(
        store.list("alice/../bob/").await,
        Err(ObjectStoreError::InvalidKey(_))
    ));
}

#[tokio::test]
async fn test_delete_by_prefix() {
    let (_dir, store) = test_store();

    for id in ["f1", "f2", "f3"] {
        let key = object_key("bob", id, ".bin");
        store.put(&key, Bytes::from("x"), "application/octet-stream").await.unwrap();
    }
    store
        .put("alice/keep.bin", Bytes::from("x"), "application/octet-stream")
        .await
        .unwrap();

    assert_eq!(store.delete_by_prefix(&owner_prefix("bob")).await.unwrap(), 3);
    assert!(store.list(&owner_prefix("bob")).await.unwrap().is_empty());
    assert!(store.exists("alice/keep.bin").await.unwrap());

    // A prefix with nothing under it is a successful no-op
    assert_eq!(store.delete_by_prefix(&owner_prefix("bob")).await.unwrap(), 0);
    assert_eq!(store.delete_by_prefix(&owner_prefix("nobody")).await.unwrap(), 0);
}
