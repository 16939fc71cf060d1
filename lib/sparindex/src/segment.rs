//! Extraction of the join scopes the matcher works on.

use crate::algebra::{Expression, GraphPattern, TriplePattern};

/// The boundary a [`QuerySegment`] has been extracted from.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum SegmentKind {
    Join,
    Filter,
    /// The segment covers the required side of a `LeftJoin`.
    Optional {
        /// Argument slot of the optional side.
        right: usize,
        expression: Option<Expression>,
    },
}

/// An element of a segment, in the order of the original tree.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash)]
pub enum SegmentItem {
    Leaf(usize),
    Argument(usize),
}

/// A join scope: triple patterns and opaque sub-trees joined together, with the filters
/// applying to them.
///
/// Arguments are sub-trees the matcher does not look into (nested optionals, unions,
/// projections...). They are rewritten independently.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct QuerySegment {
    kind: SegmentKind,
    leaves: Vec<TriplePattern>,
    arguments: Vec<GraphPattern>,
    items: Vec<SegmentItem>,
    filters: Vec<Expression>,
}

impl QuerySegment {
    /// Extracts the segment rooted at `node`.
    ///
    /// Returns `None` if `node` is not a join, a filter or a left join.
    pub fn extract(node: &GraphPattern) -> Option<Self> {
        let mut segment = Self {
            kind: SegmentKind::Join,
            leaves: Vec::new(),
            arguments: Vec::new(),
            items: Vec::new(),
            filters: Vec::new(),
        };
        match node {
            GraphPattern::Join { .. } => segment.add(node, true),
            GraphPattern::Filter { .. } => {
                segment.kind = SegmentKind::Filter;
                segment.add(node, true)
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                segment.add(left, true);
                segment.kind = SegmentKind::Optional {
                    right: segment.arguments.len(),
                    expression: expression.clone(),
                };
                segment.arguments.push(right.as_ref().clone());
            }
            _ => return None,
        }
        Some(segment)
    }

    fn add(&mut self, pattern: &GraphPattern, is_root: bool) {
        match pattern {
            GraphPattern::Triple(triple) => {
                self.items.push(SegmentItem::Leaf(self.leaves.len()));
                self.leaves.push(triple.clone());
            }
            GraphPattern::Join { left, right } => {
                self.add(left, false);
                self.add(right, false);
            }
            GraphPattern::Filter { expression, inner }
                if is_root || is_safe_to_hoist(expression, inner) =>
            {
                self.filters.extend(expression.clone().into_conjuncts());
                self.add(inner, is_root);
            }
            _ => {
                self.items.push(SegmentItem::Argument(self.arguments.len()));
                self.arguments.push(pattern.clone());
            }
        }
    }

    #[inline]
    pub fn kind(&self) -> &SegmentKind {
        &self.kind
    }

    /// The triple patterns of the join scope.
    #[inline]
    pub fn leaves(&self) -> &[TriplePattern] {
        &self.leaves
    }

    /// The sub-trees left unanalyzed, including the optional side of a left join.
    #[inline]
    pub fn arguments(&self) -> &[GraphPattern] {
        &self.arguments
    }

    #[inline]
    pub fn items(&self) -> &[SegmentItem] {
        &self.items
    }

    /// The filter conjuncts hoisted from the scope.
    #[inline]
    pub fn filters(&self) -> &[Expression] {
        &self.filters
    }
}

/// A filter below a join may only be moved up if it does not depend on the join siblings.
fn is_safe_to_hoist(expression: &Expression, inner: &GraphPattern) -> bool {
    let bound = inner.certainly_bound_variables();
    expression
        .used_variables()
        .into_iter()
        .all(|v| bound.contains(v))
}
