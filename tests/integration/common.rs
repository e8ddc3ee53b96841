//! Shared fixtures for integration tests.

use std::fs;
use std::path::PathBuf;

use odb_rs::Store;

/// A store in a scratch directory, removed on drop.
pub struct TempStore {
    pub root: PathBuf,
    pub store: Store,
}

impl TempStore {
    pub fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "odb-it-{tag}-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = fs::remove_dir_all(&root);
        let store = Store::open(&root).expect("open store");
        Self { root, store }
    }
}

impl Drop for TempStore {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}
