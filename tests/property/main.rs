//! Property-based soundness tests.
//!
//! Run with: `cargo test --test property`

mod delta_roundtrip;
mod object_roundtrip;
