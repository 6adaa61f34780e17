#![allow(unused_doc_comments)]
/**
 * This style of comments threw out warnings.
 * This allow statement fixes that
 */

/**
 * lib.rs
 */

pub mod coord;
pub mod error;
pub mod nat_traversal;

pub use coord::{CoordConfig, CoordServer};
pub use error::{Error, Result};
pub use nat_traversal::{ClientConfig, NatTraversal, TraversalSession};
