//! Tree position: materialized paths and sibling allocation.

pub mod path;
pub mod sibling;

pub use path::{MAX_SIBLINGS, ancestor_paths, encode, last_segment_seq};
pub use sibling::next_seq;
