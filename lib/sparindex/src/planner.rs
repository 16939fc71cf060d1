use crate::algebra::{ExternalIndexNode, GraphPattern, Variable};
use crate::combinations::{Combinations, RewrittenSegment, greedy_combination};
use crate::error::RewriteError;
use crate::index::IndexCatalogue;
use crate::matcher::{Candidate, VariableUsage, match_at_most, match_unclaimed};
use crate::rating::{CardinalityRater, PlanRater, select_best};
use crate::segment::QuerySegment;
use std::fmt;
use std::iter::FusedIterator;
use std::sync::Arc;
use tracing::{debug, debug_span, trace};

/// How the planner chooses between the substitutions available in a segment.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default)]
pub enum PlanningMode {
    /// A single plan, substituting the first match of each index, in catalogue order, among the
    /// patterns not substituted yet.
    #[default]
    Greedy,
    /// Every set of non-conflicting substitutions of every segment.
    Exhaustive,
    /// A single plan, keeping in each segment the substitutions the rater prefers.
    Optimal,
}

/// Bounds on the work done by a planning pass.
///
/// ```
/// use sparindex::PlanningLimits;
///
/// let limits = PlanningLimits {
///     max_plans: Some(100),
///     ..PlanningLimits::default()
/// };
/// assert_eq!(limits.max_candidates_per_segment, Some(64));
/// ```
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PlanningLimits {
    /// Maximum number of candidates kept for a segment, the first ones found being kept.
    ///
    /// Default: 64
    pub max_candidates_per_segment: Option<usize>,

    /// Maximum number of alternative plans.
    ///
    /// Going over it fails with [`RewriteError::TooManyPlans`].
    /// Default: 10,000
    pub max_plans: Option<usize>,
}

impl Default for PlanningLimits {
    fn default() -> Self {
        Self {
            max_candidates_per_segment: Some(64),
            max_plans: Some(10_000),
        }
    }
}

impl PlanningLimits {
    /// No limit at all.
    #[inline]
    pub fn unlimited() -> Self {
        Self {
            max_candidates_per_segment: None,
            max_plans: None,
        }
    }
}

/// Rewrites query trees to use the indices of an [`IndexCatalogue`].
///
/// ```
/// use sparindex::algebra::{GraphPattern, NamedNode, TriplePattern, Variable};
/// use sparindex::{
///     ExternalIndex, IndexCatalogue, IndexPlanner, MemoryPcjStorage, PcjDefinition, PcjIndex,
///     PlanStatistics, PlanningMode,
/// };
/// use std::sync::Arc;
///
/// let talks_to = NamedNode::new("http://example.com/talksTo")?;
/// let label = NamedNode::new("http://example.com/label")?;
/// let pattern = |s: &str, p: &NamedNode, o: &str| -> Result<GraphPattern, Box<dyn std::error::Error>> {
///     Ok(TriplePattern::new(Variable::new(s)?, p.clone(), Variable::new(o)?).into())
/// };
///
/// let index = PcjIndex::new(
///     PcjDefinition {
///         id: "talks".into(),
///         query: GraphPattern::join(pattern("e", &talks_to, "l")?, pattern("l", &label, "c")?),
///         cardinality: 100,
///     },
///     Arc::new(MemoryPcjStorage::new()),
/// )?;
/// let index: Arc<dyn ExternalIndex> = Arc::new(index);
/// let catalogue = IndexCatalogue::new([index])?;
///
/// let query = GraphPattern::join(pattern("x", &talks_to, "y")?, pattern("y", &label, "z")?);
/// let plan = IndexPlanner::new(catalogue)
///     .with_mode(PlanningMode::Greedy)
///     .optimize(&query)?;
/// let statistics = PlanStatistics::of(&plan);
/// assert_eq!(statistics.index_nodes.len(), 1);
/// assert_eq!(statistics.residual_triple_patterns, 0);
/// # Result::<_, Box<dyn std::error::Error>>::Ok(())
/// ```
#[derive(Clone)]
pub struct IndexPlanner {
    catalogue: IndexCatalogue,
    mode: PlanningMode,
    rater: Arc<dyn PlanRater>,
    limits: PlanningLimits,
}

impl IndexPlanner {
    #[must_use]
    #[inline]
    pub fn new(catalogue: IndexCatalogue) -> Self {
        Self {
            catalogue,
            mode: PlanningMode::default(),
            rater: Arc::new(CardinalityRater),
            limits: PlanningLimits::default(),
        }
    }

    #[must_use]
    #[inline]
    pub fn with_mode(mut self, mode: PlanningMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the cost function used by [`PlanningMode::Optimal`].
    #[must_use]
    #[inline]
    pub fn with_rater(mut self, rater: impl PlanRater + 'static) -> Self {
        self.rater = Arc::new(rater);
        self
    }

    #[must_use]
    #[inline]
    pub fn with_limits(mut self, limits: PlanningLimits) -> Self {
        self.limits = limits;
        self
    }

    #[inline]
    pub fn catalogue(&self) -> &IndexCatalogue {
        &self.catalogue
    }

    /// Returns the alternative plans for `pattern`.
    ///
    /// There is a single plan except in [`PlanningMode::Exhaustive`] mode where there is one plan
    /// per element of the cross product of the combinations of every rewritten segment.
    pub fn plans(&self, pattern: &GraphPattern) -> Result<RewrittenPlans, RewriteError> {
        let _span = debug_span!(
            "index_planning",
            mode = ?self.mode,
            indices = self.catalogue.len()
        )
        .entered();
        let usage = VariableUsage::new(pattern);
        let space = self.plan_space(pattern, &usage)?;
        let count = space.count();
        if let Some(limit) = self.limits.max_plans {
            if count > limit {
                return Err(RewriteError::TooManyPlans { limit });
            }
        }
        debug!(plans = count, "planning done");
        Ok(RewrittenPlans {
            space,
            count,
            position: 0,
        })
    }

    /// Returns the plan of the configured mode, the first one in [`PlanningMode::Exhaustive`] mode.
    pub fn optimize(&self, pattern: &GraphPattern) -> Result<GraphPattern, RewriteError> {
        self.plans(pattern)?.next_plan()
    }

    fn plan_space(
        &self,
        pattern: &GraphPattern,
        usage: &VariableUsage,
    ) -> Result<PlanSpace, RewriteError> {
        if let Some(segment) = QuerySegment::extract(pattern) {
            let segment = Arc::new(segment);
            let choices = self.rewrite_segment(&segment, usage)?;
            let arguments = segment
                .arguments()
                .iter()
                .map(|argument| self.plan_space(argument, usage))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PlanSpace::Segment {
                choices,
                arguments,
                original: pattern.clone(),
            });
        }
        Ok(match pattern {
            GraphPattern::Project { inner, variables } => PlanSpace::Project {
                inner: Box::new(self.plan_space(inner, usage)?),
                variables: variables.clone(),
            },
            GraphPattern::Distinct { inner } => {
                PlanSpace::Distinct(Box::new(self.plan_space(inner, usage)?))
            }
            GraphPattern::Union { left, right } => PlanSpace::Union(
                Box::new(self.plan_space(left, usage)?),
                Box::new(self.plan_space(right, usage)?),
            ),
            pattern => PlanSpace::Fixed(pattern.clone()),
        })
    }

    fn rewrite_segment(
        &self,
        segment: &Arc<QuerySegment>,
        usage: &VariableUsage,
    ) -> Result<Vec<RewrittenSegment>, RewriteError> {
        let (choices, candidate_count) = match self.mode {
            PlanningMode::Greedy => {
                let candidates = self.greedy_candidates(segment, usage);
                let count = candidates.len();
                (
                    vec![greedy_combination(Arc::clone(segment), candidates)],
                    count,
                )
            }
            PlanningMode::Exhaustive => {
                let candidates = self.all_candidates(segment, usage);
                let count = candidates.len();
                (self.combinations(segment, candidates)?, count)
            }
            PlanningMode::Optimal => {
                let candidates = self.all_candidates(segment, usage);
                let count = candidates.len();
                let best = select_best(self.rater.as_ref(), self.combinations(segment, candidates)?)
                    .unwrap_or_else(|| RewrittenSegment::unchanged(Arc::clone(segment)));
                (vec![best], count)
            }
        };
        debug!(
            leaves = segment.leaves().len(),
            candidates = candidate_count,
            combinations = choices.len(),
            "segment rewritten"
        );
        Ok(choices)
    }

    /// The first match of each index over the leaves the previous indices left.
    fn greedy_candidates(&self, segment: &QuerySegment, usage: &VariableUsage) -> Vec<Candidate> {
        let mut claimed = vec![false; segment.leaves().len()];
        let mut candidates = Vec::new();
        for index in self.catalogue.iter() {
            if let Some(limit) = self.limits.max_candidates_per_segment {
                if candidates.len() >= limit {
                    debug!(limit, "too many candidates, the next indices are ignored");
                    break;
                }
            }
            let Some(candidate) = match_unclaimed(index, segment, usage, &claimed) else {
                continue;
            };
            trace!(
                index = index.id(),
                leaves = ?candidate.consumed_leaves(),
                "index matched"
            );
            for leaf in candidate.consumed_leaves() {
                claimed[*leaf] = true;
            }
            candidates.push(candidate);
        }
        candidates
    }

    fn all_candidates(&self, segment: &QuerySegment, usage: &VariableUsage) -> Vec<Candidate> {
        let mut candidates = Vec::<Candidate>::new();
        for index in self.catalogue.iter() {
            let remaining = self
                .limits
                .max_candidates_per_segment
                .map(|limit| limit.saturating_sub(candidates.len()));
            if remaining == Some(0) {
                debug!(
                    candidates = candidates.len(),
                    "too many candidates, the next indices are ignored"
                );
                break;
            }
            let found = match_at_most(index, segment, usage, remaining);
            trace!(index = index.id(), candidates = found.len(), "index matched");
            candidates.extend(found);
        }
        candidates
    }

    /// Every set of non-conflicting candidates, failing past `max_plans`.
    fn combinations(
        &self,
        segment: &Arc<QuerySegment>,
        candidates: Vec<Candidate>,
    ) -> Result<Vec<RewrittenSegment>, RewriteError> {
        let mut combinations = Vec::new();
        for combination in Combinations::new(Arc::clone(segment), candidates) {
            if let Some(limit) = self.limits.max_plans {
                if combinations.len() >= limit {
                    return Err(RewriteError::TooManyPlans { limit });
                }
            }
            combinations.push(combination);
        }
        Ok(combinations)
    }
}

impl fmt::Debug for IndexPlanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexPlanner")
            .field("catalogue", &self.catalogue)
            .field("mode", &self.mode)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// The choices made while planning, plans are materialized on demand.
enum PlanSpace {
    Fixed(GraphPattern),
    Segment {
        choices: Vec<RewrittenSegment>,
        arguments: Vec<PlanSpace>,
        original: GraphPattern,
    },
    Project {
        inner: Box<PlanSpace>,
        variables: Vec<Variable>,
    },
    Distinct(Box<PlanSpace>),
    Union(Box<PlanSpace>, Box<PlanSpace>),
}

impl PlanSpace {
    fn count(&self) -> usize {
        match self {
            Self::Fixed(_) => 1,
            Self::Segment {
                choices, arguments, ..
            } => arguments
                .iter()
                .map(Self::count)
                .fold(choices.len(), usize::saturating_mul),
            Self::Project { inner, .. } | Self::Distinct(inner) => inner.count(),
            Self::Union(left, right) => left.count().saturating_mul(right.count()),
        }
    }

    /// Builds the plan at `position` in the mixed radix enumeration of the choices.
    fn materialize(&self, mut position: usize) -> GraphPattern {
        match self {
            Self::Fixed(pattern) => pattern.clone(),
            Self::Segment {
                choices,
                arguments,
                original,
            } => {
                let Some(choice) = choices.get(position % choices.len().max(1)) else {
                    return original.clone();
                };
                position /= choices.len();
                let arguments = arguments
                    .iter()
                    .map(|argument| {
                        let count = argument.count().max(1);
                        let pattern = argument.materialize(position % count);
                        position /= count;
                        pattern
                    })
                    .collect::<Vec<_>>();
                if choice.candidates().is_empty() && arguments == choice.segment().arguments() {
                    // nothing substituted, the original filter placement is kept
                    return original.clone();
                }
                choice
                    .build(&arguments)
                    .unwrap_or_else(|| original.clone())
            }
            Self::Project { inner, variables } => {
                GraphPattern::project(inner.materialize(position), variables.clone())
            }
            Self::Distinct(inner) => GraphPattern::distinct(inner.materialize(position)),
            Self::Union(left, right) => {
                let left_count = left.count().max(1);
                GraphPattern::union(
                    left.materialize(position % left_count),
                    right.materialize(position / left_count),
                )
            }
        }
    }
}

/// The alternative plans of a query, built lazily.
///
/// The sequence can only be consumed once, forward.
pub struct RewrittenPlans {
    space: PlanSpace,
    count: usize,
    position: usize,
}

impl RewrittenPlans {
    /// Returns the next plan or [`RewriteError::Exhausted`] if there is none left.
    pub fn next_plan(&mut self) -> Result<GraphPattern, RewriteError> {
        self.next().ok_or(RewriteError::Exhausted)
    }
}

impl Iterator for RewrittenPlans {
    type Item = GraphPattern;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.count {
            return None;
        }
        let plan = self.space.materialize(self.position);
        self.position += 1;
        Some(plan)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.count - self.position;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for RewrittenPlans {}

impl FusedIterator for RewrittenPlans {}

/// What a plan substitutes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PlanStatistics {
    /// The index nodes of the plan, from left to right.
    pub index_nodes: Vec<ExternalIndexNode>,
    /// Number of triple patterns not substituted.
    pub residual_triple_patterns: usize,
}

impl PlanStatistics {
    pub fn of(plan: &GraphPattern) -> Self {
        let mut index_nodes = Vec::new();
        plan.lookup_external_index_nodes(&mut |node| index_nodes.push(node.clone()));
        Self {
            index_nodes,
            residual_triple_patterns: plan.triple_pattern_count(),
        }
    }
}
