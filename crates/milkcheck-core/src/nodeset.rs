//! Cluster node-set expressions.
//!
//! A node set names a group of cluster nodes in folded form, e.g.
//! `node[1-4,7]`, `db[01-03]-ib` or `web1,web2`. Parsing expands bracketed
//! ranges into individual node names; [`fmt::Display`] folds trailing
//! numeric suffixes back into ranges.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while parsing a node-set expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeSetParseError {
    #[error("empty node set expression")]
    Empty,

    #[error("unbalanced brackets in {0:?}")]
    UnbalancedBrackets(String),

    #[error("invalid range {0:?}")]
    InvalidRange(String),
}

/// An ordered set of cluster node names.
///
/// Order is first-appearance order of the parsed expression; duplicates are
/// dropped. Equality ignores order.
#[derive(Debug, Clone, Default)]
pub struct NodeSet {
    nodes: Vec<String>,
}

impl NodeSet {
    /// Empty node set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a node-set expression. See the module docs for the syntax.
    pub fn parse(expr: &str) -> Result<Self, NodeSetParseError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(NodeSetParseError::Empty);
        }

        let mut set = NodeSet::new();
        for part in split_outside_brackets(expr)? {
            let part = part.trim();
            if part.is_empty() {
                return Err(NodeSetParseError::Empty);
            }
            expand_part(part, &mut set)?;
        }
        Ok(set)
    }

    /// Number of nodes in the set.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    /// Iterate over node names in set order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    /// Add a single node, keeping the set duplicate-free.
    pub fn push(&mut self, node: impl Into<String>) {
        let node = node.into();
        if !self.contains(&node) {
            self.nodes.push(node);
        }
    }

    /// Union with another set, preserving this set's order first.
    pub fn extend(&mut self, other: &NodeSet) {
        for node in other.iter() {
            self.push(node);
        }
    }

    /// Nodes present in both sets, in this set's order.
    pub fn intersect(&self, other: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self
                .nodes
                .iter()
                .filter(|n| other.contains(n))
                .cloned()
                .collect(),
        }
    }

    /// Nodes of this set absent from `other`, in this set's order.
    pub fn subtract(&self, other: &NodeSet) -> NodeSet {
        NodeSet {
            nodes: self
                .nodes
                .iter()
                .filter(|n| !other.contains(n))
                .cloned()
                .collect(),
        }
    }
}

impl PartialEq for NodeSet {
    fn eq(&self, other: &Self) -> bool {
        self.nodes.iter().collect::<BTreeSet<_>>() == other.nodes.iter().collect::<BTreeSet<_>>()
    }
}

impl Eq for NodeSet {}

impl FromStr for NodeSet {
    type Err = NodeSetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NodeSet::parse(s)
    }
}

impl FromIterator<String> for NodeSet {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        let mut set = NodeSet::new();
        for node in iter {
            set.push(node);
        }
        set
    }
}

/// Split a full expression on commas that are not inside brackets.
fn split_outside_brackets(expr: &str) -> Result<Vec<&str>, NodeSetParseError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in expr.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| NodeSetParseError::UnbalancedBrackets(expr.to_owned()))?;
            }
            ',' if depth == 0 => {
                parts.push(&expr[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(NodeSetParseError::UnbalancedBrackets(expr.to_owned()));
    }
    parts.push(&expr[start..]);
    Ok(parts)
}

/// Expand one comma-separated part (`prefix[ranges]suffix` or a bare name).
fn expand_part(part: &str, out: &mut NodeSet) -> Result<(), NodeSetParseError> {
    let Some(open) = part.find('[') else {
        out.push(part);
        return Ok(());
    };
    let close = part
        .find(']')
        .ok_or_else(|| NodeSetParseError::UnbalancedBrackets(part.to_owned()))?;
    if close < open {
        return Err(NodeSetParseError::UnbalancedBrackets(part.to_owned()));
    }

    let prefix = &part[..open];
    let ranges = &part[open + 1..close];
    let suffix = &part[close + 1..];
    if suffix.contains('[') {
        // Nested bracket groups are not supported.
        return Err(NodeSetParseError::InvalidRange(part.to_owned()));
    }

    for token in ranges.split(',') {
        let token = token.trim();
        let (lo, hi) = match token.split_once('-') {
            Some((lo, hi)) => (lo, hi),
            None => (token, token),
        };
        let width = if lo.len() > 1 && lo.starts_with('0') {
            lo.len()
        } else {
            0
        };
        let lo: u64 = lo
            .parse()
            .map_err(|_| NodeSetParseError::InvalidRange(token.to_owned()))?;
        let hi: u64 = hi
            .parse()
            .map_err(|_| NodeSetParseError::InvalidRange(token.to_owned()))?;
        if hi < lo {
            return Err(NodeSetParseError::InvalidRange(token.to_owned()));
        }
        for n in lo..=hi {
            out.push(format!("{prefix}{n:0width$}{suffix}"));
        }
    }
    Ok(())
}

impl fmt::Display for NodeSet {
    /// Fold trailing numeric suffixes back into `prefix[lo-hi,...]` form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut groups: Vec<(String, usize, Vec<u64>)> = Vec::new();
        let mut plain: Vec<&str> = Vec::new();

        for node in &self.nodes {
            match split_trailing_digits(node) {
                Some((stem, num, width)) => {
                    match groups.iter_mut().find(|(s, w, _)| s == stem && *w == width) {
                        Some((_, _, nums)) => nums.push(num),
                        None => groups.push((stem.to_owned(), width, vec![num])),
                    }
                }
                None => plain.push(node),
            }
        }

        let mut rendered: Vec<String> = plain.iter().map(|s| (*s).to_owned()).collect();
        for (stem, width, mut nums) in groups {
            nums.sort_unstable();
            nums.dedup();
            if nums.len() == 1 {
                rendered.push(format!("{stem}{:0width$}", nums[0]));
                continue;
            }
            let mut spans: Vec<String> = Vec::new();
            let mut lo = nums[0];
            let mut hi = nums[0];
            for &n in &nums[1..] {
                if n == hi + 1 {
                    hi = n;
                } else {
                    spans.push(render_span(lo, hi, width));
                    lo = n;
                    hi = n;
                }
            }
            spans.push(render_span(lo, hi, width));
            rendered.push(format!("{stem}[{}]", spans.join(",")));
        }

        f.write_str(&rendered.join(","))
    }
}

fn render_span(lo: u64, hi: u64, width: usize) -> String {
    if lo == hi {
        format!("{lo:0width$}")
    } else {
        format!("{lo:0width$}-{hi:0width$}")
    }
}

/// Split `node12` into `("node", 12, width)`; `None` when the name does not
/// end with digits. Width is kept only for zero-padded numbers.
fn split_trailing_digits(node: &str) -> Option<(&str, u64, usize)> {
    let digits = node.chars().rev().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    let split = node.len() - digits;
    let num_str = &node[split..];
    let num: u64 = num_str.parse().ok()?;
    let width = if num_str.len() > 1 && num_str.starts_with('0') {
        num_str.len()
    } else {
        0
    };
    Some((&node[..split], num, width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_node() {
        let set = NodeSet::parse("web1").unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains("web1"));
    }

    #[test]
    fn expands_simple_range() {
        let set = NodeSet::parse("node[1-4]").unwrap();
        assert_eq!(
            set.iter().collect::<Vec<_>>(),
            vec!["node1", "node2", "node3", "node4"]
        );
    }

    #[test]
    fn expands_mixed_ranges_and_singles() {
        let set = NodeSet::parse("node[1-2,5]").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["node1", "node2", "node5"]);
    }

    #[test]
    fn keeps_zero_padding() {
        let set = NodeSet::parse("db[01-03]").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["db01", "db02", "db03"]);
    }

    #[test]
    fn expands_suffix_after_brackets() {
        let set = NodeSet::parse("node[1-2]-ib").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["node1-ib", "node2-ib"]);
    }

    #[test]
    fn unions_comma_separated_parts() {
        let set = NodeSet::parse("node[1-2],web1,node2").unwrap();
        assert_eq!(set.iter().collect::<Vec<_>>(), vec!["node1", "node2", "web1"]);
    }

    #[test]
    fn rejects_empty_expression() {
        assert!(matches!(NodeSet::parse("  "), Err(NodeSetParseError::Empty)));
        assert!(matches!(NodeSet::parse("a,,b"), Err(NodeSetParseError::Empty)));
    }

    #[test]
    fn rejects_unbalanced_brackets() {
        assert!(matches!(
            NodeSet::parse("node[1-2"),
            Err(NodeSetParseError::UnbalancedBrackets(_))
        ));
        assert!(matches!(
            NodeSet::parse("node]1["),
            Err(NodeSetParseError::UnbalancedBrackets(_))
        ));
    }

    #[test]
    fn rejects_descending_range() {
        assert!(matches!(
            NodeSet::parse("node[4-1]"),
            Err(NodeSetParseError::InvalidRange(_))
        ));
    }

    #[test]
    fn display_folds_ranges() {
        let set = NodeSet::parse("node1,node2,node3,node7").unwrap();
        assert_eq!(set.to_string(), "node[1-3,7]");
    }

    #[test]
    fn display_keeps_single_node_flat() {
        let set = NodeSet::parse("web4").unwrap();
        assert_eq!(set.to_string(), "web4");
    }

    #[test]
    fn display_round_trips() {
        for expr in ["node[1-5]", "db[01-03]", "a1,b1", "front,node[2-3]"] {
            let set = NodeSet::parse(expr).unwrap();
            let folded = set.to_string();
            assert_eq!(NodeSet::parse(&folded).unwrap(), set, "expr {expr:?}");
        }
    }

    #[test]
    fn intersect_and_subtract() {
        let all = NodeSet::parse("node[1-6]").unwrap();
        let some = NodeSet::parse("node[4-8]").unwrap();
        assert_eq!(all.intersect(&some).to_string(), "node[4-6]");
        assert_eq!(all.subtract(&some).to_string(), "node[1-3]");
    }

    #[test]
    fn equality_ignores_order() {
        let a = NodeSet::parse("node2,node1").unwrap();
        let b = NodeSet::parse("node[1-2]").unwrap();
        assert_eq!(a, b);
    }
}
