//! Pack write, ingest, and read-back flows.

use std::fs;
use std::io::Cursor;
use std::sync::Arc;

use odb_rs::tree_entry::TreeEntry;
use odb_rs::{
    scan_pack, write_pack, Object, ObjectFormat, ObjectKind, PackInput, PackPlanOptions,
    PackScanLimits, Tree,
};

use crate::common::TempStore;

fn pack_dir_names(t: &TempStore) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(t.root.join("objects/pack"))
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

/// Ingest a pack holding a blob, a delta of it, and a tree referencing
/// both.
#[test]
fn ingest_pack_with_delta_and_tree() {
    let producer = TempStore::new("delta-producer");
    let consumer = TempStore::new("delta-consumer");

    // A: a blob; B: a near-copy so the planner deltas it; C: a tree
    // referencing both.
    let a_payload: Vec<u8> = (0u32..4000).flat_map(|i| i.to_le_bytes()).collect();
    let mut b_payload = a_payload.clone();
    b_payload.extend_from_slice(b"delta tail");

    let (a_oid, _) = producer
        .store
        .write(&Object::Blob(a_payload.clone()))
        .unwrap();
    let (b_oid, _) = producer
        .store
        .write(&Object::Blob(b_payload.clone()))
        .unwrap();
    let tree = Object::Tree(Tree {
        entries: vec![
            TreeEntry {
                mode: 0o100644,
                name: b"a.bin".to_vec(),
                oid: a_oid,
            },
            TreeEntry {
                mode: 0o100644,
                name: b"b.bin".to_vec(),
                oid: b_oid,
            },
        ],
    });
    let (c_oid, _) = producer.store.write(&tree).unwrap();

    let mut pack_bytes = Vec::new();
    producer
        .store
        .make_pack(&[a_oid, b_oid, c_oid], &mut pack_bytes)
        .unwrap();

    // The pack really contains a delta entry.
    let mut scratch = Vec::new();
    let info = scan_pack(
        &pack_bytes,
        ObjectFormat::Sha1,
        &PackScanLimits::default(),
        &mut scratch,
    )
    .unwrap();
    assert!(info.records.iter().any(|r| r.kind.is_delta()));

    let outcome = consumer.store.ingest(&mut Cursor::new(pack_bytes)).unwrap();
    assert_eq!(outcome.object_count, 3);

    // All three are listed, B's size is its inflated size, and B reads
    // back to its literal bytes.
    let listed = consumer.store.list().unwrap();
    for oid in [a_oid, b_oid, c_oid] {
        assert!(listed.contains(&oid));
    }
    assert_eq!(consumer.store.size(&b_oid).unwrap(), b_payload.len() as u64);
    assert_eq!(
        &*consumer.store.read(&b_oid).unwrap(),
        &Object::Blob(b_payload)
    );
    assert_eq!(&*consumer.store.read(&c_oid).unwrap(), &tree);
}

/// Every indexed entry reconstructs to bytes hashing to its OID.
#[test]
fn ingested_pack_passes_index_verification() {
    let t = TempStore::new("fidelity");
    let mut oids = Vec::new();
    let shared: Vec<u8> = (0u32..2000).flat_map(|i| i.to_le_bytes()).collect();
    for i in 0u8..6 {
        let mut payload = shared.clone();
        payload.push(i);
        let (oid, _) = t.store.write(&Object::Blob(payload)).unwrap();
        oids.push(oid);
    }

    let mut pack_bytes = Vec::new();
    t.store.make_pack(&oids, &mut pack_bytes).unwrap();
    let outcome = t.store.ingest(&mut Cursor::new(pack_bytes)).unwrap();

    t.store.verify_pack(&outcome.pack_digest).unwrap();
}

/// Packed and loose forms of the same object read identically.
#[test]
fn pack_and_loose_reads_are_equivalent() {
    let t = TempStore::new("equiv");
    let object = Object::Blob(b"the same object either way".to_vec());
    let (oid, _) = t.store.write(&object).unwrap();

    let loose_read = t.store.read(&oid).unwrap();

    let mut pack_bytes = Vec::new();
    t.store.make_pack(&[oid], &mut pack_bytes).unwrap();
    t.store.ingest(&mut Cursor::new(pack_bytes)).unwrap();
    t.store.clear_caches();

    // The pack is read-preferred now; the value must not change.
    let packed_read = t.store.read(&oid).unwrap();
    assert_eq!(loose_read, packed_read);
}

/// A failed ingestion publishes no pack or index file.
#[test]
fn failed_ingest_publishes_nothing() {
    let t = TempStore::new("atomic");
    let (oid, _) = t.store.write(&Object::Blob(b"seed".to_vec())).unwrap();

    let mut pack_bytes = Vec::new();
    t.store.make_pack(&[oid], &mut pack_bytes).unwrap();
    let len = pack_bytes.len();
    pack_bytes[len - 10] ^= 0xff; // corrupt the trailer digest

    let before = pack_dir_names(&t);
    assert!(t.store.ingest(&mut Cursor::new(pack_bytes)).is_err());
    assert_eq!(pack_dir_names(&t), before);

    // The scratch directory holds no leftovers either.
    assert_eq!(fs::read_dir(t.root.join("tmp")).unwrap().count(), 0);
}

/// Ingested objects are immediately observable.
#[test]
fn ingest_then_read_sees_every_object() {
    let source = TempStore::new("visible-src");
    let sink = TempStore::new("visible-dst");

    let mut oids = Vec::new();
    for i in 0u8..20 {
        let (oid, _) = source
            .store
            .write(&Object::Blob(vec![i; 64 + usize::from(i)]))
            .unwrap();
        oids.push(oid);
    }

    let mut pack_bytes = Vec::new();
    source.store.make_pack(&oids, &mut pack_bytes).unwrap();
    sink.store.ingest(&mut Cursor::new(pack_bytes)).unwrap();

    for (i, oid) in oids.iter().enumerate() {
        assert!(sink.store.contains(oid).unwrap());
        assert_eq!(
            &*sink.store.read(oid).unwrap(),
            &Object::Blob(vec![i as u8; 64 + i])
        );
    }
}

/// Repack folds everything into one pack and retires the old ones.
#[test]
fn repack_supersedes_existing_packs() {
    let t = TempStore::new("repack");

    // Two separate ingests produce two packs.
    for tag in [b'x', b'y'] {
        let (oid, _) = t.store.write(&Object::Blob(vec![tag; 512])).unwrap();
        let mut bytes = Vec::new();
        t.store.make_pack(&[oid], &mut bytes).unwrap();
        t.store.ingest(&mut Cursor::new(bytes)).unwrap();
    }
    let (loose_only, _) = t.store.write(&Object::Blob(b"still loose".to_vec())).unwrap();
    assert_eq!(pack_dir_names(&t).len(), 4); // two packs, two indexes

    let all_before = t.store.list().unwrap();
    let digest = t.store.repack().unwrap().expect("non-empty store");

    // One pack remains and it contains every live object.
    let names = pack_dir_names(&t);
    assert_eq!(names.len(), 2);
    assert!(names.contains(&format!("pack-{}.pack", digest.to_hex())));

    let all_after = t.store.list().unwrap();
    assert_eq!(all_before, all_after);
    assert_eq!(
        &*t.store.read(&loose_only).unwrap(),
        &Object::Blob(b"still loose".to_vec())
    );
}

/// Concurrent cold reads of a deep delta chain return identical bytes.
#[test]
fn concurrent_cold_reads_agree() {
    let t = TempStore::new("concurrent");

    // Build a chain of similar blobs so the pack holds nested deltas.
    let mut payloads = vec![(0u32..3000).flat_map(|i| i.to_le_bytes()).collect::<Vec<u8>>()];
    for depth in 1..4 {
        let mut next = payloads[depth - 1].clone();
        next.extend_from_slice(format!("layer {depth}").as_bytes());
        payloads.push(next);
    }

    let inputs: Vec<PackInput> = payloads
        .iter()
        .map(|p| PackInput::new(ObjectKind::Blob, p.clone()))
        .collect();
    let mut pack_bytes = Vec::new();
    write_pack(inputs, &PackPlanOptions::default(), &mut pack_bytes).unwrap();
    t.store.ingest(&mut Cursor::new(pack_bytes)).unwrap();
    t.store.clear_caches();

    let deepest = Object::Blob(payloads.last().unwrap().clone());
    let want = deepest.id(ObjectFormat::Sha1);

    let store = Arc::new(t);
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || store.store.read(&want).unwrap().payload())
        })
        .collect();
    let results: Vec<Vec<u8>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[0], results[1]);
    assert_eq!(&results[0], payloads.last().unwrap());
}
