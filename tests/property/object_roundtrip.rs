//! Object encode/decode soundness.

use proptest::prelude::*;

use odb_rs::tree_entry::TreeEntry;
use odb_rs::{Commit, Object, ObjectFormat, ObjectId, ObjectKind, Tree};

fn oid_strategy() -> impl Strategy<Value = ObjectId> {
    any::<[u8; 20]>().prop_map(ObjectId::sha1)
}

/// Names are non-empty, slash-free, NUL-free bytes.
fn name_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(
        any::<u8>().prop_filter("no separators", |b| *b != 0 && *b != b'/'),
        1..32,
    )
}

fn ident() -> Vec<u8> {
    b"Prop Tester <prop@example.com> 1700000000 +0000".to_vec()
}

proptest! {
    /// Tree payloads decode back to the entries that produced them.
    #[test]
    fn tree_round_trips(
        entries in prop::collection::vec(
            (prop_oneof![
                Just(0o100644u32),
                Just(0o100755u32),
                Just(0o040000u32),
                Just(0o120000u32),
            ], name_strategy(), oid_strategy()),
            0..24,
        )
    ) {
        let tree = Object::Tree(Tree {
            entries: entries
                .into_iter()
                .map(|(mode, name, oid)| TreeEntry { mode, name, oid })
                .collect(),
        });
        let payload = tree.payload();
        let decoded = Object::decode(ObjectKind::Tree, &payload, ObjectFormat::Sha1).unwrap();
        prop_assert_eq!(decoded, tree);
    }

    /// Commits decode back byte-for-byte, including arbitrary messages.
    #[test]
    fn commit_round_trips(
        tree in oid_strategy(),
        parents in prop::collection::vec(oid_strategy(), 0..4),
        message in prop::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut trailer = b"\n".to_vec();
        trailer.extend_from_slice(&message);
        let commit = Object::Commit(Commit {
            tree,
            parents,
            author: ident(),
            committer: ident(),
            trailer,
        });

        let payload = commit.payload();
        let decoded = Object::decode(ObjectKind::Commit, &payload, ObjectFormat::Sha1).unwrap();
        prop_assert_eq!(decoded.payload(), payload);
        prop_assert_eq!(decoded, commit);
    }

    /// Equal canonical bytes imply equal digests; the digest changes when
    /// the payload does.
    #[test]
    fn digests_track_content(payload in prop::collection::vec(any::<u8>(), 0..512)) {
        let a = Object::Blob(payload.clone());
        let b = Object::Blob(payload.clone());
        prop_assert_eq!(a.id(ObjectFormat::Sha1), b.id(ObjectFormat::Sha1));

        let mut changed = payload;
        changed.push(0x01);
        let c = Object::Blob(changed);
        prop_assert_ne!(a.id(ObjectFormat::Sha1), c.id(ObjectFormat::Sha1));
    }
}
