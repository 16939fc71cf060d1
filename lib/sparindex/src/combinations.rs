//! Enumeration of the sets of candidates that can be substituted together.

use crate::algebra::{Expression, ExternalIndexNode, GraphPattern, TriplePattern};
use crate::error::RewriteError;
use crate::filters::relocate_filters;
use crate::matcher::Candidate;
use crate::segment::{QuerySegment, SegmentItem, SegmentKind};
use std::iter::FusedIterator;
use std::sync::Arc;

/// A segment with a set of non-conflicting candidates applied.
///
/// The segment itself is shared, not modified.
#[derive(Debug, Clone)]
pub struct RewrittenSegment {
    segment: Arc<QuerySegment>,
    candidates: Vec<Candidate>,
}

/// An element of a [`RewrittenSegment`], in the order of the original segment.
#[derive(Debug, Clone)]
pub enum RewrittenItem<'a> {
    Index(ExternalIndexNode),
    Leaf(&'a TriplePattern),
    /// An argument slot of the segment.
    Argument(usize),
}

impl RewrittenSegment {
    /// The segment without any substitution.
    pub fn unchanged(segment: Arc<QuerySegment>) -> Self {
        Self {
            segment,
            candidates: Vec::new(),
        }
    }

    #[inline]
    pub fn segment(&self) -> &QuerySegment {
        &self.segment
    }

    #[inline]
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Number of leaves replaced by index nodes.
    pub fn consumed_leaf_count(&self) -> usize {
        self.candidates
            .iter()
            .map(|c| c.consumed_leaves().len())
            .sum()
    }

    /// The segment items, each index node taking the place of its first consumed leaf.
    pub fn items(&self) -> Vec<RewrittenItem<'_>> {
        let mut owner = vec![None; self.segment.leaves().len()];
        for (i, candidate) in self.candidates.iter().enumerate() {
            for leaf in candidate.consumed_leaves() {
                owner[*leaf] = Some(i);
            }
        }
        self.segment
            .items()
            .iter()
            .filter_map(|item| match item {
                SegmentItem::Leaf(leaf) => Some(match owner[*leaf] {
                    None => RewrittenItem::Leaf(&self.segment.leaves()[*leaf]),
                    Some(c) => {
                        let candidate = &self.candidates[c];
                        if candidate.consumed_leaves().first() != Some(leaf) {
                            return None;
                        }
                        RewrittenItem::Index(candidate.to_node(&self.segment))
                    }
                }),
                SegmentItem::Argument(argument) => Some(RewrittenItem::Argument(*argument)),
            })
            .collect()
    }

    /// The segment filters no index applies.
    pub fn residual_filters(&self) -> impl Iterator<Item = &Expression> {
        self.segment
            .filters()
            .iter()
            .enumerate()
            .filter(|(i, _)| {
                !self
                    .candidates
                    .iter()
                    .any(|c| c.consumed_filters().contains(i))
            })
            .map(|(_, f)| f)
    }

    /// Builds the tree of the segment, using `arguments` for the argument slots.
    pub fn build(&self, arguments: &[GraphPattern]) -> Option<GraphPattern> {
        let nodes = self
            .items()
            .into_iter()
            .map(|item| {
                Some(match item {
                    RewrittenItem::Index(node) => GraphPattern::ExternalIndex(node),
                    RewrittenItem::Leaf(pattern) => GraphPattern::Triple(pattern.clone()),
                    RewrittenItem::Argument(i) => arguments.get(i)?.clone(),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        let tree = relocate_filters(self.residual_filters().cloned(), nodes)?;
        Some(match self.segment.kind() {
            SegmentKind::Join | SegmentKind::Filter => tree,
            SegmentKind::Optional { right, expression } => {
                GraphPattern::left_join(tree, arguments.get(*right)?.clone(), expression.clone())
            }
        })
    }

    /// Builds the tree of the segment with its original arguments.
    pub fn to_graph_pattern(&self) -> Option<GraphPattern> {
        self.build(self.segment.arguments())
    }
}

/// Every set of pairwise non-conflicting candidates of a segment, as [`RewrittenSegment`]s.
///
/// The empty set, i.e. the unchanged segment, comes first.
/// The sequence can only be consumed once, forward.
///
/// ```
/// use sparindex::{Combinations, QuerySegment};
/// use sparindex::algebra::{GraphPattern, NamedNode, TriplePattern, Variable};
/// use std::sync::Arc;
///
/// let p = NamedNode::new("http://example.com/p")?;
/// let pattern = GraphPattern::join(
///     TriplePattern::new(Variable::new("a")?, p.clone(), Variable::new("b")?).into(),
///     TriplePattern::new(Variable::new("b")?, p, Variable::new("c")?).into(),
/// );
/// let segment = Arc::new(QuerySegment::extract(&pattern).unwrap());
/// let mut combinations = Combinations::new(segment, Vec::new());
/// assert!(combinations.next_combination().is_ok());
/// assert!(combinations.next_combination().is_err());
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
pub struct Combinations {
    segment: Arc<QuerySegment>,
    candidates: Vec<Candidate>,
    /// candidates of the current set, increasing
    chosen: Vec<usize>,
    state: State,
}

#[derive(Clone, Copy, Eq, PartialEq)]
enum State {
    Start,
    Running,
    Done,
}

impl Combinations {
    pub fn new(segment: Arc<QuerySegment>, candidates: Vec<Candidate>) -> Self {
        Self {
            segment,
            candidates,
            chosen: Vec::new(),
            state: State::Start,
        }
    }

    /// Returns the next combination or [`RewriteError::Exhausted`] if there is none left.
    pub fn next_combination(&mut self) -> Result<RewrittenSegment, RewriteError> {
        self.next().ok_or(RewriteError::Exhausted)
    }

    fn next_compatible(&self, from: usize) -> Option<usize> {
        (from..self.candidates.len()).find(|j| {
            self.chosen
                .iter()
                .all(|c| !self.candidates[*c].conflicts_with(&self.candidates[*j]))
        })
    }

    fn advance(&mut self) -> bool {
        let from = self.chosen.last().map_or(0, |last| last + 1);
        if let Some(j) = self.next_compatible(from) {
            self.chosen.push(j);
            return true;
        }
        while let Some(last) = self.chosen.pop() {
            if let Some(j) = self.next_compatible(last + 1) {
                self.chosen.push(j);
                return true;
            }
        }
        false
    }

    fn current(&self) -> RewrittenSegment {
        RewrittenSegment {
            segment: Arc::clone(&self.segment),
            candidates: self
                .chosen
                .iter()
                .map(|c| self.candidates[*c].clone())
                .collect(),
        }
    }
}

impl Iterator for Combinations {
    type Item = RewrittenSegment;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            State::Start => self.state = State::Running,
            State::Running => {
                if !self.advance() {
                    self.state = State::Done;
                    return None;
                }
            }
            State::Done => return None,
        }
        Some(self.current())
    }
}

impl FusedIterator for Combinations {}

/// Accepts candidates in discovery order, at most one per index, skipping the ones conflicting
/// with an already accepted candidate.
pub fn greedy_combination(
    segment: Arc<QuerySegment>,
    candidates: impl IntoIterator<Item = Candidate>,
) -> RewrittenSegment {
    let mut accepted = Vec::<Candidate>::new();
    for candidate in candidates {
        if accepted.iter().all(|a| {
            a.index().id() != candidate.index().id() && !a.conflicts_with(&candidate)
        }) {
            accepted.push(candidate);
        }
    }
    RewrittenSegment {
        segment,
        candidates: accepted,
    }
}
