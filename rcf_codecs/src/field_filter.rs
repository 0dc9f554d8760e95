//! Inclusion sets over protobuf field paths, used by the transpose decoder
//! to project records down to a subset of fields.

use std::collections::HashMap;

/// A tree of accepted field paths. Each path is a sequence of field numbers
/// from the message root; including a path includes its whole subtree.
#[derive(Debug, Clone, Default)]
pub struct FieldFilter {
    /// `None` means all fields are included.
    root: Option<FilterNode>,
}

#[derive(Debug, Clone, Default)]
struct FilterNode {
    children: HashMap<u32, FilterNode>,
    /// True when a filter path terminates here, including the subtree below.
    terminal: bool,
}

impl FieldFilter {
    /// A filter that includes every field.
    pub fn all() -> Self {
        FieldFilter { root: None }
    }

    /// A filter that includes exactly the subtrees rooted at `paths`.
    ///
    /// An empty path set includes nothing except non-proto records, which
    /// always pass through verbatim.
    pub fn including<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: AsRef<[u32]>,
    {
        let mut root = FilterNode::default();
        for path in paths {
            let mut node = &mut root;
            for &field in path.as_ref() {
                node = node.children.entry(field).or_default();
            }
            node.terminal = true;
        }
        FieldFilter { root: Some(root) }
    }

    pub fn include_all(&self) -> bool {
        self.root.is_none()
    }

    /// Whether the field at `path` is included (some filter path is a prefix
    /// of `path`).
    pub fn includes(&self, path: &[u32]) -> bool {
        let Some(root) = &self.root else {
            return true;
        };
        let mut node = root;
        for field in path {
            if node.terminal {
                return true;
            }
            match node.children.get(field) {
                Some(child) => node = child,
                None => return false,
            }
        }
        node.terminal
    }

    /// Whether a submessage at `path` must be entered: either its subtree is
    /// included, or some included path runs through it.
    pub fn enters(&self, path: &[u32]) -> bool {
        let Some(root) = &self.root else {
            return true;
        };
        let mut node = root;
        for field in path {
            if node.terminal {
                return true;
            }
            match node.children.get(field) {
                Some(child) => node = child,
                None => return false,
            }
        }
        // Ran out of path inside the tree: an included path continues below.
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_includes_everything() {
        let filter = FieldFilter::all();
        assert!(filter.include_all());
        assert!(filter.includes(&[1]));
        assert!(filter.includes(&[7, 3, 2]));
        assert!(filter.enters(&[9]));
    }

    #[test]
    fn subtree_inclusion() {
        let filter = FieldFilter::including([vec![1], vec![2, 3]]);
        assert!(!filter.include_all());

        assert!(filter.includes(&[1]));
        assert!(filter.includes(&[1, 5])); // whole subtree under 1
        assert!(filter.includes(&[2, 3]));
        assert!(filter.includes(&[2, 3, 8]));

        assert!(!filter.includes(&[2]));
        assert!(!filter.includes(&[2, 4]));
        assert!(!filter.includes(&[3]));
    }

    #[test]
    fn ancestors_are_entered_but_not_included() {
        let filter = FieldFilter::including([vec![2, 3]]);
        assert!(filter.enters(&[2]));
        assert!(!filter.includes(&[2]));
        assert!(filter.enters(&[2, 3]));
        assert!(filter.enters(&[2, 3, 1])); // inside an included subtree
        assert!(!filter.enters(&[4]));
        assert!(!filter.enters(&[2, 4]));
    }

    #[test]
    fn empty_filter_includes_nothing() {
        let filter = FieldFilter::including(Vec::<Vec<u32>>::new());
        assert!(!filter.include_all());
        assert!(!filter.includes(&[1]));
        assert!(!filter.enters(&[1]));
    }
}
