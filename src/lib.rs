//! A lock-free singly linked list that pushes and pops at the tail end.
//!
//! Pushing and popping at the tail is usually associated with stacks or LIFO
//! queues, but most lock-free implementations either use doubly linked nodes
//! or operate on the head for performance. This list keeps the nodes singly
//! linked: `push` appends in O(1) with the Michael-Scott protocol, while
//! `pop` pays a full forward scan from the sentinel to locate the last node
//! and its predecessor. `insert_after` links a new node right after the
//! first node holding a given value.
//!
//! Memory is reclaimed with [`crossbeam_epoch`]: operations take a pinned
//! [`Guard`](crossbeam_epoch::Guard), and an unlinked node is destroyed only
//! after every thread pinned at unlink time has unpinned.

#![warn(missing_docs, missing_debug_implementations)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod list;

pub use list::TailList;
