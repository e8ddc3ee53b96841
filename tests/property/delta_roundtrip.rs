//! Delta encode/apply soundness.
//!
//! The generator derives targets from bases by splicing edits (replace,
//! insert, delete, append) so the encoder sees realistic mixes of
//! copyable runs and fresh literals. Whatever the planner produces, the
//! applier must reproduce the target exactly.

use proptest::prelude::*;

use odb_rs::{apply_delta, delta_sizes, encode_delta};

/// One splice edit applied to a base buffer.
#[derive(Clone, Debug)]
enum Edit {
    Replace { at: usize, bytes: Vec<u8> },
    Insert { at: usize, bytes: Vec<u8> },
    Delete { at: usize, len: usize },
}

fn apply_edit(buf: &mut Vec<u8>, edit: &Edit) {
    match edit {
        Edit::Replace { at, bytes } => {
            let at = at % (buf.len() + 1);
            let end = (at + bytes.len()).min(buf.len());
            buf.splice(at..end, bytes.iter().copied());
        }
        Edit::Insert { at, bytes } => {
            let at = at % (buf.len() + 1);
            buf.splice(at..at, bytes.iter().copied());
        }
        Edit::Delete { at, len } => {
            let at = at % (buf.len() + 1);
            let end = (at + len).min(buf.len());
            buf.drain(at..end);
        }
    }
}

fn edit_strategy() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (any::<usize>(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(at, bytes)| Edit::Replace { at, bytes }),
        (any::<usize>(), prop::collection::vec(any::<u8>(), 0..64))
            .prop_map(|(at, bytes)| Edit::Insert { at, bytes }),
        (any::<usize>(), 0..256usize).prop_map(|(at, len)| Edit::Delete { at, len }),
    ]
}

proptest! {
    /// encode -> apply reproduces the target byte-for-byte.
    #[test]
    fn encode_apply_round_trips(
        base in prop::collection::vec(any::<u8>(), 0..4096),
        edits in prop::collection::vec(edit_strategy(), 0..8),
    ) {
        let mut target = base.clone();
        for edit in &edits {
            apply_edit(&mut target, edit);
        }

        let delta = encode_delta(&base, &target);
        let (base_size, result_size) = delta_sizes(&delta).unwrap();
        prop_assert_eq!(base_size, base.len());
        prop_assert_eq!(result_size, target.len());

        let mut out = Vec::new();
        apply_delta(&base, &delta, &mut out, target.len()).unwrap();
        prop_assert_eq!(out, target);
    }

    /// Deltas of mostly-shared content stay below the raw payload size.
    #[test]
    fn similar_content_compresses(
        base in prop::collection::vec(any::<u8>(), 2048..4096),
        tail in prop::collection::vec(any::<u8>(), 0..128),
    ) {
        let mut target = base.clone();
        target.extend_from_slice(&tail);

        let delta = encode_delta(&base, &target);
        prop_assert!(delta.len() < target.len());
    }

    /// Applying against the wrong base is always rejected.
    #[test]
    fn wrong_base_is_rejected(
        base in prop::collection::vec(any::<u8>(), 64..512),
        extra in 1..64usize,
    ) {
        let target = base.clone();
        let delta = encode_delta(&base, &target);

        let mut wrong = base.clone();
        wrong.extend(std::iter::repeat(0xaa).take(extra));
        let mut out = Vec::new();
        prop_assert!(apply_delta(&wrong, &delta, &mut out, target.len()).is_err());
    }
}
