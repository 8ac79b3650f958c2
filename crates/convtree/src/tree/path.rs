//! Materialized path encoding.
//!
//! A node path is the chain of fixed-width sibling sequences from the root down to the node,
//! joined by `/` (e.g. `01/03/02`). Because every segment has the same width, plain string
//! comparison of two paths yields tree pre-order, and sibling order within a parent.

use crate::error::{ConversationError, ConversationResult};

/// Separator between path segments.
pub const SEPARATOR: char = '/';

/// Width of a single zero-padded segment.
pub const SEGMENT_WIDTH: usize = 2;

/// Largest sibling sequence a parent can hand out.
pub const MAX_SIBLINGS: i64 = 99;

/// Encode the path of the `seq`-th child under `parent_path`.
///
/// `None` or an empty parent path produces a root path.
pub fn encode(parent_path: Option<&str>, seq: i64) -> ConversationResult<String> {
    if seq < 1 {
        return Err(ConversationError::InvalidSegment(seq));
    }
    let parent_path = parent_path.filter(|p| !p.is_empty());
    if seq > MAX_SIBLINGS {
        return Err(ConversationError::TooManySiblings {
            parent_path: parent_path.map(str::to_string),
        });
    }

    let segment = format!("{:0width$}", seq, width = SEGMENT_WIDTH);
    Ok(match parent_path {
        Some(parent) => format!("{parent}{SEPARATOR}{segment}"),
        None => segment,
    })
}

/// Sequence number of the last segment, or 0 when it is missing or unparseable.
pub fn last_segment_seq(path: &str) -> i64 {
    path.rsplit(SEPARATOR)
        .next()
        .and_then(|segment| segment.trim().parse::<i64>().ok())
        .filter(|seq| *seq >= 0)
        .unwrap_or(0)
}

/// Number of segments in `path`; 0 for the empty path.
pub fn depth(path: &str) -> usize {
    if path.is_empty() {
        0
    } else {
        path.split(SEPARATOR).count()
    }
}

/// Paths of every ancestor of `path`, root first. The path itself is not included.
pub fn ancestor_paths(path: &str) -> Vec<String> {
    path.char_indices()
        .filter(|(_, c)| *c == SEPARATOR)
        .map(|(idx, _)| path[..idx].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_root_and_child() {
        assert_eq!(encode(None, 1).unwrap(), "01");
        assert_eq!(encode(Some(""), 7).unwrap(), "07");
        assert_eq!(encode(Some("01"), 12).unwrap(), "01/12");
        assert_eq!(encode(Some("01/12"), 99).unwrap(), "01/12/99");
    }

    #[test]
    fn encode_rejects_out_of_range_sequences() {
        assert!(matches!(
            encode(None, 0),
            Err(ConversationError::InvalidSegment(0))
        ));
        assert!(matches!(
            encode(Some("01"), -3),
            Err(ConversationError::InvalidSegment(-3))
        ));
        match encode(Some("02"), 100) {
            Err(ConversationError::TooManySiblings { parent_path }) => {
                assert_eq!(parent_path.as_deref(), Some("02"));
            }
            other => panic!("expected TooManySiblings, got {:?}", other),
        }
    }

    #[test]
    fn last_segment_defaults_to_zero() {
        assert_eq!(last_segment_seq("01/04"), 4);
        assert_eq!(last_segment_seq("09"), 9);
        assert_eq!(last_segment_seq(""), 0);
        assert_eq!(last_segment_seq("01/xx"), 0);
        assert_eq!(last_segment_seq("01/"), 0);
    }

    #[test]
    fn lexicographic_order_is_preorder() {
        let mut paths = vec!["02", "01/02", "01", "01/01/01", "01/01", "10", "02/01"];
        paths.sort();
        assert_eq!(
            paths,
            vec!["01", "01/01", "01/01/01", "01/02", "02", "02/01", "10"]
        );
    }

    #[test]
    fn ancestors_and_depth() {
        assert_eq!(ancestor_paths("01/02/03"), vec!["01", "01/02"]);
        assert!(ancestor_paths("05").is_empty());
        assert_eq!(depth("01/02/03"), 3);
        assert_eq!(depth(""), 0);
    }
}
