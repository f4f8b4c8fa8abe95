#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
// Life of an insert:
// 1. Read the header page for the root
// 2. Walk internal nodes to the leaf that owns the key
// 3. Append to the leaf if it fits; otherwise
//     - Oversized value: write an overflowed leaf and its segment chain
//     - Last leaf: split it and link the new leaves into the parent
//     - Any other leaf: keep the smallest entries and shift the rest forward
// 4. Rewrite the parent, splitting it and growing a new root as needed
//
// System components:
//  - Page store (file or simulated)
//  - Node codec
//  - Tree engine and crawler

pub mod btree;
pub mod config;
pub mod simulation;
pub mod storage;

#[cfg(test)]
mod testing;

pub use btree::{BTreeError, Crawler, Tree};
pub use storage::{FilePageStore, PageStore};
