//! Internal tests module
//!
//! Multi-node scenarios run against an in-memory membership network and have
//! full access to private crate internals.

mod comprehensive;
