//! Cost based choice between rewritten segments.

use crate::algebra::{GraphPattern, TermPattern, TriplePattern};
use crate::combinations::{RewrittenItem, RewrittenSegment};
use oxrdf::Variable;
use rustc_hash::FxHashSet;
use std::cmp::max;

/// A cost function for [`RewrittenSegment`]s. The lower, the better.
pub trait PlanRater: Send + Sync {
    fn rate(&self, segment: &RewrittenSegment) -> usize;
}

/// Rates a segment by the sum of the estimated sizes of its intermediate join results,
/// joining the smallest inputs first.
///
/// Index nodes are estimated with their index cardinality and triple patterns from their
/// bound positions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CardinalityRater;

impl PlanRater for CardinalityRater {
    fn rate(&self, segment: &RewrittenSegment) -> usize {
        let arguments = segment.segment().arguments();
        let mut inputs = segment
            .items()
            .into_iter()
            .map(|item| match item {
                RewrittenItem::Index(node) => (
                    node.cardinality(),
                    node.variables().iter().cloned().collect(),
                ),
                RewrittenItem::Leaf(pattern) => (
                    estimate_triple_pattern_size(pattern),
                    pattern.variables().into_iter().cloned().collect(),
                ),
                RewrittenItem::Argument(i) => arguments.get(i).map_or_else(
                    || (0, FxHashSet::default()),
                    |a| (estimate_graph_pattern_size(a), a.certainly_bound_variables()),
                ),
            })
            .collect::<Vec<(usize, FxHashSet<Variable>)>>();
        inputs.sort_by_key(|(size, _)| *size);

        let mut inputs = inputs.into_iter();
        let Some((mut size, mut variables)) = inputs.next() else {
            return 0;
        };
        let mut cost = size;
        for (input_size, input_variables) in inputs {
            let keys = input_variables
                .iter()
                .filter(|v| variables.contains(*v))
                .count();
            size = estimate_join_size(size, input_size, keys);
            cost = cost.saturating_add(size);
            variables.extend(input_variables);
        }
        cost
    }
}

/// Keeps the combination with the lowest cost.
///
/// Ties are broken by the number of consumed leaves (the more the better), then by order.
pub fn select_best(
    rater: &dyn PlanRater,
    combinations: impl IntoIterator<Item = RewrittenSegment>,
) -> Option<RewrittenSegment> {
    let mut best: Option<(usize, RewrittenSegment)> = None;
    for combination in combinations {
        let cost = rater.rate(&combination);
        let is_better = best.as_ref().is_none_or(|(best_cost, best)| {
            cost < *best_cost
                || (cost == *best_cost
                    && combination.consumed_leaf_count() > best.consumed_leaf_count())
        });
        if is_better {
            best = Some((cost, combination));
        }
    }
    best.map(|(_, combination)| combination)
}

fn estimate_join_size(left: usize, right: usize, keys: usize) -> usize {
    left.saturating_mul(right)
        .saturating_div(1_000_usize.saturating_pow(keys.try_into().unwrap_or(u32::MAX)))
}

fn estimate_graph_pattern_size(pattern: &GraphPattern) -> usize {
    match pattern {
        GraphPattern::Triple(pattern) => estimate_triple_pattern_size(pattern),
        GraphPattern::Join { left, right } => {
            let keys = left
                .certainly_bound_variables()
                .intersection(&right.certainly_bound_variables())
                .count();
            estimate_join_size(
                estimate_graph_pattern_size(left),
                estimate_graph_pattern_size(right),
                keys,
            )
        }
        GraphPattern::LeftJoin { left, right, .. } => {
            let keys = left
                .certainly_bound_variables()
                .intersection(&right.certainly_bound_variables())
                .count();
            let left_size = estimate_graph_pattern_size(left);
            max(
                left_size,
                estimate_join_size(left_size, estimate_graph_pattern_size(right), keys),
            )
        }
        GraphPattern::Union { left, right } => {
            estimate_graph_pattern_size(left).saturating_add(estimate_graph_pattern_size(right))
        }
        GraphPattern::Filter { inner, .. }
        | GraphPattern::Project { inner, .. }
        | GraphPattern::Distinct { inner } => estimate_graph_pattern_size(inner),
        GraphPattern::ExternalIndex(node) => node.cardinality(),
    }
}

fn estimate_triple_pattern_size(pattern: &TriplePattern) -> usize {
    let is_bound = |t: &TermPattern| !t.is_variable();
    match (
        is_bound(&pattern.subject),
        is_bound(&pattern.predicate),
        is_bound(&pattern.object),
    ) {
        (true, true, true) => 1,
        (true, true, false) => 10,
        (true, false, true) => 2,
        (false, true, true) => 10_000,
        (true, false, false) => 100,
        (false, false, false) => 1_000_000_000,
        (false, true, false) => 1_000_000,
        (false, false, true) => 100_000,
    }
}
