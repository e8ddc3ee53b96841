//! Reference store behavior through the façade.

use std::fs;

use odb_rs::{ObjectId, RefError, RefValue};

use crate::common::TempStore;

fn oid(byte: u8) -> ObjectId {
    ObjectId::sha1([byte; 20])
}

/// The per-file ref shadows a packed-refs entry of the same name.
#[test]
fn per_file_ref_shadows_packed_refs() {
    let t = TempStore::new("shadowing");
    let refs = t.store.refs();

    refs.write_oid("refs/heads/feature", &oid(0x11)).unwrap();
    // Simulate an out-of-band packed-refs write carrying a stale value.
    fs::write(
        t.root.join("packed-refs"),
        format!(
            "# pack-refs with: peeled fully-peeled sorted \n{} refs/heads/feature\n",
            oid(0x22).to_hex()
        ),
    )
    .unwrap();
    refs.invalidate_shadow();

    assert_eq!(refs.resolve("refs/heads/feature").unwrap(), oid(0x11));
}

#[test]
fn write_visibility_survives_packed_presence() {
    let t = TempStore::new("writevis");
    let refs = t.store.refs();

    refs.write_packed_table([("refs/heads/main".to_owned(), oid(0x01))])
        .unwrap();
    refs.write_oid("refs/heads/main", &oid(0x02)).unwrap();
    assert_eq!(refs.resolve("refs/heads/main").unwrap(), oid(0x02));

    // The packed entry is gone, so deleting the file cannot resurrect
    // the old value.
    fs::remove_file(t.root.join("refs/heads/main")).unwrap();
    refs.invalidate_shadow();
    assert!(matches!(
        refs.read("refs/heads/main"),
        Err(RefError::NotFound { .. })
    ));
}

#[test]
fn remove_clears_loose_and_packed_forms() {
    let t = TempStore::new("remove");
    let refs = t.store.refs();

    refs.write_packed_table([
        ("refs/heads/packed-only".to_owned(), oid(0x0a)),
        ("refs/heads/both".to_owned(), oid(0x0b)),
    ])
    .unwrap();
    refs.write_oid("refs/heads/both", &oid(0x0c)).unwrap();

    refs.remove("refs/heads/packed-only").unwrap();
    refs.remove("refs/heads/both").unwrap();

    for name in ["refs/heads/packed-only", "refs/heads/both"] {
        assert!(
            matches!(refs.read(name), Err(RefError::NotFound { .. })),
            "{name} should be gone"
        );
    }
}

#[test]
fn head_resolves_through_chain() {
    let t = TempStore::new("headchain");
    let refs = t.store.refs();

    refs.write_oid("refs/heads/master", &oid(0x42)).unwrap();
    assert_eq!(refs.resolve("HEAD").unwrap(), oid(0x42));
}

#[test]
fn graph_resolves_and_keeps_danglers() {
    let t = TempStore::new("graph");
    let refs = t.store.refs();

    refs.write_oid("refs/heads/master", &oid(0x10)).unwrap();
    refs.write(
        "refs/heads/alias",
        &RefValue::Symbolic("refs/heads/master".into()),
    )
    .unwrap();
    refs.write(
        "refs/heads/dangling",
        &RefValue::Symbolic("refs/heads/nowhere".into()),
    )
    .unwrap();

    let graph = refs.graph().unwrap();
    assert_eq!(
        graph.get("refs/heads/alias"),
        Some(&RefValue::Direct(oid(0x10)))
    );
    assert_eq!(graph.get("HEAD"), Some(&RefValue::Direct(oid(0x10))));
    assert_eq!(
        graph.get("refs/heads/dangling"),
        Some(&RefValue::Symbolic("refs/heads/nowhere".into()))
    );
}

#[test]
fn list_spans_file_and_packed_refs() {
    let t = TempStore::new("list");
    let refs = t.store.refs();

    refs.write_oid("refs/heads/a", &oid(0x01)).unwrap();
    refs.write_packed_table([("refs/tags/v1".to_owned(), oid(0x02))])
        .unwrap();

    assert_eq!(
        refs.list().unwrap(),
        vec!["refs/heads/a".to_owned(), "refs/tags/v1".to_owned()]
    );
}
