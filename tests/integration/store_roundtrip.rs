//! Store-level round trips: writes, reads, digests, caches, reset.

use std::fs;

use odb_rs::{Commit, Object, ObjectId, StoreError, Tree};
use odb_rs::tree_entry::TreeEntry;

use crate::common::TempStore;

const IDENT: &[u8] = b"A U Thor <au@example.com> 1700000000 +0000";

#[test]
fn fresh_repo_has_default_head() {
    let t = TempStore::new("head");
    assert_eq!(
        fs::read(t.root.join("HEAD")).unwrap(),
        b"ref: refs/heads/master\n"
    );
}

#[test]
fn blob_hello_has_git_digest() {
    let t = TempStore::new("hello");
    let (oid, _) = t.store.write(&Object::Blob(b"hello\n".to_vec())).unwrap();
    assert_eq!(oid.to_hex(), "ce013625030ba8dba906f756967f9e9ca394464a");

    let loose = t
        .root
        .join("objects/ce/013625030ba8dba906f756967f9e9ca394464a");
    assert!(loose.is_file());
}

#[test]
fn empty_tree_has_git_digest() {
    let t = TempStore::new("emptytree");
    let (oid, _) = t
        .store
        .write(&Object::Tree(Tree { entries: vec![] }))
        .unwrap();
    assert_eq!(oid.to_hex(), "4b825dc642cb6eb9a060e54bf8d69288fbee4904");
}

#[test]
fn every_kind_round_trips() {
    let t = TempStore::new("kinds");

    let blob = Object::Blob(vec![0x42; 1024]);
    let (blob_oid, _) = t.store.write(&blob).unwrap();

    let tree = Object::Tree(Tree {
        entries: vec![TreeEntry {
            mode: 0o100644,
            name: b"data.bin".to_vec(),
            oid: blob_oid,
        }],
    });
    let (tree_oid, _) = t.store.write(&tree).unwrap();

    let commit = Object::Commit(Commit {
        tree: tree_oid,
        parents: vec![],
        author: IDENT.to_vec(),
        committer: IDENT.to_vec(),
        trailer: b"\nimport\n".to_vec(),
    });
    let (commit_oid, _) = t.store.write(&commit).unwrap();

    assert_eq!(&*t.store.read(&blob_oid).unwrap(), &blob);
    assert_eq!(&*t.store.read(&tree_oid).unwrap(), &tree);
    assert_eq!(&*t.store.read(&commit_oid).unwrap(), &commit);

    let mut listed = t.store.list().unwrap();
    listed.sort();
    let mut expected = vec![blob_oid, tree_oid, commit_oid];
    expected.sort();
    assert_eq!(listed, expected);
}

#[test]
fn write_is_idempotent() {
    let t = TempStore::new("idem");
    let blob = Object::Blob(b"twice".to_vec());

    let (first, first_written) = t.store.write(&blob).unwrap();
    let (second, second_written) = t.store.write(&blob).unwrap();

    assert_eq!(first, second);
    assert!(first_written > 0);
    assert_eq!(second_written, 0);
    assert_eq!(t.store.list().unwrap().len(), 1);
}

#[test]
fn content_addressing_is_deterministic() {
    let a = TempStore::new("det-a");
    let b = TempStore::new("det-b");
    let payload = Object::Blob(b"same content, different stores".to_vec());
    let (oid_a, _) = a.store.write(&payload).unwrap();
    let (oid_b, _) = b.store.write(&payload).unwrap();
    assert_eq!(oid_a, oid_b);
}

#[test]
fn size_does_not_require_read() {
    let t = TempStore::new("size");
    let body = vec![0x11u8; 1_000_000];
    let (oid, _) = t.store.write(&Object::Blob(body)).unwrap();
    assert_eq!(t.store.size(&oid).unwrap(), 1_000_000);
}

#[test]
fn cold_and_warm_reads_agree() {
    let t = TempStore::new("cachetransparency");
    let (oid, _) = t
        .store
        .write(&Object::Blob(b"transparent".to_vec()))
        .unwrap();

    let warm = t.store.read(&oid).unwrap();
    t.store.clear_caches();
    let cold = t.store.read(&oid).unwrap();
    assert_eq!(warm, cold);
}

#[test]
fn missing_objects_fail_with_not_found() {
    let t = TempStore::new("notfound");
    let ghost = ObjectId::sha1([0xee; 20]);
    assert!(matches!(
        t.store.read(&ghost),
        Err(StoreError::NotFound { .. })
    ));
    assert!(matches!(
        t.store.size(&ghost),
        Err(StoreError::NotFound { .. })
    ));
    assert!(t.store.read_inflated(&ghost).unwrap().is_none());
}

#[test]
fn contents_and_fold_cover_the_graph() {
    let t = TempStore::new("contents");
    let (blob_oid, _) = t.store.write(&Object::Blob(b"leaf".to_vec())).unwrap();
    let (tree_oid, _) = t
        .store
        .write(&Object::Tree(Tree {
            entries: vec![TreeEntry {
                mode: 0o100644,
                name: b"leaf".to_vec(),
                oid: blob_oid,
            }],
        }))
        .unwrap();

    let contents = t.store.contents().unwrap();
    assert_eq!(contents.len(), 2);

    let names = t
        .store
        .fold(
            |mut acc: Vec<String>, oid, _| {
                acc.push(oid.to_hex());
                acc
            },
            Vec::new(),
            &tree_oid,
        )
        .unwrap();
    assert_eq!(names.len(), 2);
}

#[test]
fn reset_reinitializes_the_layout() {
    let t = TempStore::new("reset");
    let (oid, _) = t.store.write(&Object::Blob(b"gone".to_vec())).unwrap();
    t.store.refs().write_oid("refs/heads/main", &oid).unwrap();

    t.store.reset().unwrap();

    assert!(t.store.list().unwrap().is_empty());
    assert!(t.root.join("objects/pack").is_dir());
    assert_eq!(
        fs::read(t.root.join("HEAD")).unwrap(),
        b"ref: refs/heads/master\n"
    );
}
