//! Store Module
//!
//! In-memory trees of latched pages holding MVV records.
//!
//! ## Responsibilities
//! - Map tree names and ids to trees
//! - Give exclusive page latches to readers, writers and pruning
//! - Ordered iteration for scans and checkpoint images
//!
//! ## Data Structure Choice
//! Each page is a BTreeMap behind a parking_lot Mutex:
//! - A page latch guards every version of the keys it holds
//! - Keys are spread over a fixed number of pages per tree by hash
//! - Ordered scans merge the pages; simple first, not the fastest

mod page;
mod tree;

pub use page::{Page, PageHandle, PageId};
pub use tree::Tree;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{KeelError, Result};

/// Identifies a tree; ids are assigned at creation and never reused
pub type TreeId = u32;

#[derive(Default)]
struct Directory {
    by_id: HashMap<u32, Arc<Tree>>,
    by_name: HashMap<String, u32>,
}

/// All trees of an engine
pub struct PageStore {
    pages_per_tree: usize,
    directory: RwLock<Directory>,
    /// Tree ids are never reused
    next_tree_id: AtomicU32,
}

impl PageStore {
    pub fn new(pages_per_tree: usize) -> Self {
        Self {
            pages_per_tree,
            directory: RwLock::new(Directory::default()),
            next_tree_id: AtomicU32::new(1),
        }
    }

    /// Reserve a fresh tree id
    pub fn allocate_tree_id(&self) -> u32 {
        self.next_tree_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Ensure future ids are above `id`
    pub fn reserve_tree_id(&self, id: u32) {
        self.next_tree_id.fetch_max(id.saturating_add(1), Ordering::AcqRel);
    }

    pub fn next_tree_id(&self) -> u32 {
        self.next_tree_id.load(Ordering::Acquire)
    }

    /// Install a tree under `id`; fails if the id or name is taken
    pub fn insert_tree(&self, id: u32, name: &str, created_at: u64) -> Result<Arc<Tree>> {
        let mut dir = self.directory.write();
        if dir.by_id.contains_key(&id) {
            return Err(KeelError::TreeExists(format!("tree id {}", id)));
        }
        if dir.by_name.contains_key(name) {
            return Err(KeelError::TreeExists(name.to_string()));
        }
        let tree = Arc::new(Tree::new(id, name, created_at, self.pages_per_tree));
        dir.by_id.insert(id, Arc::clone(&tree));
        dir.by_name.insert(name.to_string(), id);
        self.reserve_tree_id(id);
        Ok(tree)
    }

    /// Detach a tree. Holders of the `Arc` may still use it, but it can no
    /// longer be found.
    pub fn remove_tree(&self, id: u32) -> Option<Arc<Tree>> {
        let mut dir = self.directory.write();
        let tree = dir.by_id.remove(&id)?;
        if dir.by_name.get(tree.name()) == Some(&id) {
            dir.by_name.remove(tree.name());
        }
        Some(tree)
    }

    pub fn tree(&self, id: u32) -> Option<Arc<Tree>> {
        self.directory.read().by_id.get(&id).cloned()
    }

    pub fn tree_by_name(&self, name: &str) -> Option<Arc<Tree>> {
        let dir = self.directory.read();
        dir.by_name.get(name).and_then(|id| dir.by_id.get(id)).cloned()
    }

    /// Every tree, ordered by id
    pub fn trees(&self) -> Vec<Arc<Tree>> {
        let mut trees: Vec<_> = self.directory.read().by_id.values().cloned().collect();
        trees.sort_by_key(|t| t.id());
        trees
    }

    pub fn tree_count(&self) -> usize {
        self.directory.read().by_id.len()
    }

    pub fn pages_per_tree(&self) -> usize {
        self.pages_per_tree
    }
}
