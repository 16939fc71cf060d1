//! Matching of index shapes against query segments.

use crate::algebra::{Expression, ExternalIndexNode, GraphPattern, TermPattern, TriplePattern};
use crate::index::{ExternalIndex, ShapeOrder};
use crate::segment::QuerySegment;
use oxrdf::Variable;
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use tracing::trace;

/// How many times each variable occurs in a query.
///
/// Used to decide which variables an index node has to produce.
#[derive(Debug, Clone)]
pub struct VariableUsage {
    occurrences: FxHashMap<Variable, usize>,
    all_output: bool,
}

impl VariableUsage {
    pub fn new(query: &GraphPattern) -> Self {
        let mut root = query;
        while let GraphPattern::Distinct { inner } = root {
            root = inner;
        }
        let mut usage = Self {
            occurrences: FxHashMap::default(),
            all_output: !matches!(root, GraphPattern::Project { .. }),
        };
        usage.add_pattern(query);
        usage
    }

    fn add_pattern(&mut self, pattern: &GraphPattern) {
        match pattern {
            GraphPattern::Triple(triple) => self.add_triple(triple),
            GraphPattern::Join { left, right } | GraphPattern::Union { left, right } => {
                self.add_pattern(left);
                self.add_pattern(right);
            }
            GraphPattern::LeftJoin {
                left,
                right,
                expression,
            } => {
                self.add_pattern(left);
                self.add_pattern(right);
                if let Some(expression) = expression {
                    self.add_expression(expression);
                }
            }
            GraphPattern::Filter { expression, inner } => {
                self.add_expression(expression);
                self.add_pattern(inner);
            }
            GraphPattern::Project { inner, variables } => {
                for v in variables {
                    self.add(v);
                }
                self.add_pattern(inner);
            }
            GraphPattern::Distinct { inner } => self.add_pattern(inner),
            GraphPattern::ExternalIndex(node) => {
                for v in node.variables() {
                    self.add(v);
                }
            }
        }
    }

    fn add_triple(&mut self, triple: &TriplePattern) {
        for v in triple.terms().filter_map(TermPattern::as_variable) {
            self.add(v);
        }
    }

    fn add_expression(&mut self, expression: &Expression) {
        expression.lookup_used_variables(&mut |v| self.add(v));
    }

    fn add(&mut self, variable: &Variable) {
        *self.occurrences.entry(variable.clone()).or_default() += 1;
    }

    /// Is the variable used outside of the given patterns and filters?
    ///
    /// Every variable is used when the query has no projection: it is returned.
    pub fn is_used_elsewhere<'a>(
        &self,
        variable: &Variable,
        patterns: impl IntoIterator<Item = &'a TriplePattern>,
        filters: impl IntoIterator<Item = &'a Expression>,
    ) -> bool {
        if self.all_output {
            return true;
        }
        let mut local = 0;
        for pattern in patterns {
            local += pattern
                .terms()
                .filter(|t| t.as_variable() == Some(variable))
                .count();
        }
        for filter in filters {
            filter.lookup_used_variables(&mut |v| {
                if v == variable {
                    local += 1;
                }
            });
        }
        self.occurrences.get(variable).copied().unwrap_or(0) > local
    }
}

/// A possible substitution of an index for some leaves of a segment.
#[derive(Clone)]
pub struct Candidate {
    index: Arc<dyn ExternalIndex>,
    /// positions of the matched patterns in the index shape
    shape_patterns: Vec<usize>,
    leaves: Vec<usize>,
    filters: Vec<usize>,
    renaming: FxHashMap<Variable, TermPattern>,
    variables: Vec<Variable>,
}

impl Candidate {
    #[inline]
    pub fn index(&self) -> &Arc<dyn ExternalIndex> {
        &self.index
    }

    /// Positions in the index shape of the patterns matched, sorted.
    #[inline]
    pub fn shape_patterns(&self) -> &[usize] {
        &self.shape_patterns
    }

    /// Positions of the consumed leaves in the segment, sorted.
    #[inline]
    pub fn consumed_leaves(&self) -> &[usize] {
        &self.leaves
    }

    /// Positions of the consumed filters in the segment.
    #[inline]
    pub fn consumed_filters(&self) -> &[usize] {
        &self.filters
    }

    /// The query term each index variable is mapped to.
    #[inline]
    pub fn renaming(&self) -> &FxHashMap<Variable, TermPattern> {
        &self.renaming
    }

    /// The query variables the substituted node produces.
    #[inline]
    pub fn produced_variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Do the two candidates claim a same leaf?
    pub fn conflicts_with(&self, other: &Self) -> bool {
        // both are sorted
        let (mut i, mut j) = (0, 0);
        while i < self.leaves.len() && j < other.leaves.len() {
            match self.leaves[i].cmp(&other.leaves[j]) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => return true,
            }
        }
        false
    }

    /// The node replacing the consumed leaves.
    pub fn to_node(&self, segment: &QuerySegment) -> ExternalIndexNode {
        ExternalIndexNode::new(
            Arc::clone(&self.index),
            self.shape_patterns.clone(),
            self.variables.clone(),
            self.renaming.clone(),
            self.leaves
                .iter()
                .map(|i| segment.leaves()[*i].clone())
                .collect(),
            self.filters
                .iter()
                .map(|i| segment.filters()[*i].clone())
                .collect(),
        )
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("index", &self.index.id())
            .field("shape_patterns", &self.shape_patterns)
            .field("leaves", &self.leaves)
            .field("filters", &self.filters)
            .field("renaming", &self.renaming)
            .field("variables", &self.variables)
            .finish()
    }
}

/// Returns the first way `index` can be substituted for leaves of `segment`.
pub fn match_index(
    index: &Arc<dyn ExternalIndex>,
    segment: &QuerySegment,
    usage: &VariableUsage,
) -> Option<Candidate> {
    match Matcher::new(index, segment, usage)?.search(0, &mut ControlFlow::Break) {
        ControlFlow::Break(candidate) => Some(candidate),
        ControlFlow::Continue(()) => None,
    }
}

/// Returns the first way `index` can be substituted for leaves of `segment` that are not
/// `claimed` yet.
pub(crate) fn match_unclaimed(
    index: &Arc<dyn ExternalIndex>,
    segment: &QuerySegment,
    usage: &VariableUsage,
    claimed: &[bool],
) -> Option<Candidate> {
    let mut matcher = Matcher::new(index, segment, usage)?;
    for (used, claimed) in matcher.used_leaves.iter_mut().zip(claimed) {
        *used = *claimed;
    }
    let free = matcher.used_leaves.iter().filter(|used| !**used).count();
    if index.shape().required_pattern_count() > free {
        return None;
    }
    match matcher.search(0, &mut ControlFlow::Break) {
        ControlFlow::Break(candidate) => Some(candidate),
        ControlFlow::Continue(()) => None,
    }
}

/// Returns every way `index` can be substituted for leaves of `segment`.
///
/// Candidates consuming the same leaves are only returned once, in discovery order.
pub fn match_all(
    index: &Arc<dyn ExternalIndex>,
    segment: &QuerySegment,
    usage: &VariableUsage,
) -> Vec<Candidate> {
    match_at_most(index, segment, usage, None)
}

/// Like [`match_all`] but stops the search once `limit` candidates are found.
pub(crate) fn match_at_most(
    index: &Arc<dyn ExternalIndex>,
    segment: &QuerySegment,
    usage: &VariableUsage,
    limit: Option<usize>,
) -> Vec<Candidate> {
    if limit == Some(0) {
        return Vec::new();
    }
    let Some(mut matcher) = Matcher::new(index, segment, usage) else {
        return Vec::new();
    };
    let mut seen = FxHashSet::<Vec<usize>>::default();
    let mut found = Vec::<Candidate>::new();
    let flow = matcher.search(0, &mut |candidate| {
        if seen.insert(candidate.leaves.clone()) {
            found.push(candidate);
            if limit.is_some_and(|limit| found.len() >= limit) {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    });
    if flow.is_break() {
        trace!(
            index = index.id(),
            candidates = found.len(),
            "candidate limit reached"
        );
    }
    found
}

struct Matcher<'a> {
    index: &'a Arc<dyn ExternalIndex>,
    segment: &'a QuerySegment,
    usage: &'a VariableUsage,
    /// leaf matched by each shape pattern
    assignment: Vec<Option<usize>>,
    used_leaves: Vec<bool>,
    renaming: FxHashMap<Variable, TermPattern>,
    images: FxHashSet<TermPattern>,
    completions: usize,
}

impl<'a> Matcher<'a> {
    fn new(
        index: &'a Arc<dyn ExternalIndex>,
        segment: &'a QuerySegment,
        usage: &'a VariableUsage,
    ) -> Option<Self> {
        let shape = index.shape();
        if shape.required_pattern_count() > segment.leaves().len() {
            trace!(index = index.id(), "the index shape is larger than the segment");
            return None;
        }
        Some(Self {
            index,
            segment,
            usage,
            assignment: vec![None; shape.patterns().len()],
            used_leaves: vec![false; segment.leaves().len()],
            renaming: FxHashMap::default(),
            images: FxHashSet::default(),
            completions: 0,
        })
    }

    fn search<B>(
        &mut self,
        position: usize,
        on_candidate: &mut impl FnMut(Candidate) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let index = self.index;
        let segment = self.segment;
        let shape = index.shape();
        let Some(shape_pattern) = shape.patterns().get(position) else {
            return self.complete(on_candidate);
        };
        let first_leaf = match shape.order() {
            ShapeOrder::Unordered => 0,
            ShapeOrder::Ordered => self.assignment[..position]
                .iter()
                .rev()
                .find_map(|a| *a)
                .map_or(0, |l| l + 1),
        };
        let completions = self.completions;
        for leaf in first_leaf..segment.leaves().len() {
            if self.used_leaves[leaf] {
                continue;
            }
            let mut added = Vec::new();
            if self.unify_pattern(&shape_pattern.pattern, &segment.leaves()[leaf], &mut added) {
                self.assignment[position] = Some(leaf);
                self.used_leaves[leaf] = true;
                let flow = self.search(position + 1, on_candidate);
                self.used_leaves[leaf] = false;
                self.assignment[position] = None;
                if flow.is_break() {
                    return flow;
                }
            }
            for v in added {
                if let Some(image) = self.renaming.remove(&v) {
                    self.images.remove(&image);
                }
            }
        }
        if !shape_pattern.required && self.completions == completions {
            // The optional pattern can't be matched
            return self.search(position + 1, on_candidate);
        }
        ControlFlow::Continue(())
    }

    fn unify_pattern(
        &mut self,
        shape: &TriplePattern,
        query: &TriplePattern,
        added: &mut Vec<Variable>,
    ) -> bool {
        let (TermPattern::NamedNode(shape_predicate), TermPattern::NamedNode(query_predicate)) =
            (&shape.predicate, &query.predicate)
        else {
            return false;
        };
        if shape_predicate != query_predicate {
            return false;
        }
        let graphs_unify = match (&shape.graph_name, &query.graph_name) {
            (None, None) => true,
            (Some(shape), Some(query)) => self.unify_term(shape, query, added),
            _ => false,
        };
        graphs_unify
            && self.unify_term(&shape.subject, &query.subject, added)
            && self.unify_term(&shape.object, &query.object, added)
    }

    fn unify_term(
        &mut self,
        shape: &TermPattern,
        query: &TermPattern,
        added: &mut Vec<Variable>,
    ) -> bool {
        let TermPattern::Variable(variable) = shape else {
            // an index constant only matches the same query constant
            return shape == query;
        };
        if let Some(image) = self.renaming.get(variable) {
            return image == query;
        }
        if !self.images.insert(query.clone()) {
            return false;
        }
        self.renaming.insert(variable.clone(), query.clone());
        added.push(variable.clone());
        true
    }

    fn complete<B>(
        &mut self,
        on_candidate: &mut impl FnMut(Candidate) -> ControlFlow<B>,
    ) -> ControlFlow<B> {
        let Some(candidate) = self.build_candidate() else {
            return ControlFlow::Continue(());
        };
        self.completions += 1;
        on_candidate(candidate)
    }

    fn build_candidate(&self) -> Option<Candidate> {
        let shape = self.index.shape();
        let shape_patterns = self
            .assignment
            .iter()
            .enumerate()
            .filter_map(|(position, leaf)| leaf.map(|_| position))
            .collect::<Vec<_>>();
        let mut leaves = self.assignment.iter().flatten().copied().collect::<Vec<_>>();
        leaves.sort_unstable();
        let consumed_patterns = leaves
            .iter()
            .map(|l| &self.segment.leaves()[*l])
            .collect::<Vec<_>>();

        let mut renaming = self.renaming.clone();
        let mut filters = Vec::with_capacity(shape.filters().len());
        for filter in shape.filters() {
            let mut found = None;
            for (i, query_filter) in self.segment.filters().iter().enumerate() {
                if filters.contains(&i) {
                    continue;
                }
                let mut attempt = renaming.clone();
                if unify_expression(filter, query_filter, shape.parameters(), &mut attempt) {
                    renaming = attempt;
                    found = Some(i);
                    break;
                }
            }
            let Some(position) = found else {
                trace!(
                    index = self.index.id(),
                    %filter,
                    "the index filter is not in the query"
                );
                return None;
            };
            filters.push(position);
        }
        let consumed_filters = filters
            .iter()
            .map(|f| &self.segment.filters()[*f])
            .collect::<Vec<_>>();

        if let Some(class) = shape.type_requirement() {
            let Some(subject) = consumed_patterns
                .iter()
                .find(|p| p.type_constant() == Some(class))
                .map(|p| &p.subject)
            else {
                trace!(
                    index = self.index.id(),
                    %class,
                    "no consumed pattern defines the required type"
                );
                return None;
            };
            if let Some(conflict) = self.segment.leaves().iter().find(|p| {
                p.subject == *subject && p.type_constant().is_some_and(|c| c != class)
            }) {
                trace!(
                    index = self.index.id(),
                    %class,
                    %conflict,
                    "the query defines a conflicting type"
                );
                return None;
            }
        }

        let binding_names = self.index.binding_names();
        let mut variables = Vec::new();
        for (index_variable, image) in &renaming {
            if shape.parameters().contains(index_variable) {
                continue;
            }
            let exposed = binding_names.contains(index_variable);
            match image {
                TermPattern::Variable(query_variable) => {
                    let used = self.usage.is_used_elsewhere(
                        query_variable,
                        consumed_patterns.iter().copied(),
                        consumed_filters.iter().copied(),
                    );
                    if exposed {
                        if used {
                            variables.push(query_variable.clone());
                        }
                    } else if used {
                        trace!(
                            index = self.index.id(),
                            variable = %query_variable,
                            "the index does not expose a variable used in the query"
                        );
                        return None;
                    }
                }
                constant if !exposed => {
                    trace!(
                        index = self.index.id(),
                        %constant,
                        "the index can't be restricted to a constant it does not expose"
                    );
                    return None;
                }
                _ => {}
            }
        }
        // Stable order, following the index exposed variables
        variables.sort_by_key(|v| {
            binding_names
                .iter()
                .position(|b| renaming.get(b).and_then(TermPattern::as_variable) == Some(v))
        });

        Some(Candidate {
            index: Arc::clone(self.index),
            shape_patterns,
            leaves,
            filters,
            renaming,
            variables,
        })
    }
}

/// Matches an index filter with a query filter, extending `renaming`.
///
/// Index variables already renamed must match their image. `parameters` that are not renamed
/// yet match a query constant.
fn unify_expression(
    shape: &Expression,
    query: &Expression,
    parameters: &[Variable],
    renaming: &mut FxHashMap<Variable, TermPattern>,
) -> bool {
    match (shape, query) {
        (Expression::Variable(variable), query) => {
            if let Some(image) = renaming.get(variable) {
                return Expression::from(image.clone()) == *query;
            }
            if !parameters.contains(variable) {
                return false;
            }
            let image = match query {
                Expression::NamedNode(node) => TermPattern::NamedNode(node.clone()),
                Expression::Literal(literal) => TermPattern::Literal(literal.clone()),
                _ => return false,
            };
            renaming.insert(variable.clone(), image);
            true
        }
        (Expression::Bound(variable), Expression::Bound(query)) => {
            renaming.get(variable).and_then(TermPattern::as_variable) == Some(query)
        }
        (Expression::Or(shape), Expression::Or(query))
        | (Expression::And(shape), Expression::And(query)) => {
            unify_expressions(shape, query, parameters, renaming)
        }
        (Expression::FunctionCall(shape_name, shape), Expression::FunctionCall(query_name, query)) => {
            shape_name == query_name && unify_expressions(shape, query, parameters, renaming)
        }
        (Expression::Equal(a1, a2), Expression::Equal(b1, b2))
        | (Expression::SameTerm(a1, a2), Expression::SameTerm(b1, b2))
        | (Expression::Greater(a1, a2), Expression::Greater(b1, b2))
        | (Expression::GreaterOrEqual(a1, a2), Expression::GreaterOrEqual(b1, b2))
        | (Expression::Less(a1, a2), Expression::Less(b1, b2))
        | (Expression::LessOrEqual(a1, a2), Expression::LessOrEqual(b1, b2))
        | (Expression::Add(a1, a2), Expression::Add(b1, b2))
        | (Expression::Subtract(a1, a2), Expression::Subtract(b1, b2))
        | (Expression::Multiply(a1, a2), Expression::Multiply(b1, b2))
        | (Expression::Divide(a1, a2), Expression::Divide(b1, b2)) => {
            unify_expression(a1, b1, parameters, renaming)
                && unify_expression(a2, b2, parameters, renaming)
        }
        (Expression::Not(a), Expression::Not(b)) => unify_expression(a, b, parameters, renaming),
        (Expression::NamedNode(_) | Expression::Literal(_), query) => shape == query,
        _ => false,
    }
}

fn unify_expressions(
    shape: &[Expression],
    query: &[Expression],
    parameters: &[Variable],
    renaming: &mut FxHashMap<Variable, TermPattern>,
) -> bool {
    shape.len() == query.len()
        && shape
            .iter()
            .zip(query)
            .all(|(shape, query)| unify_expression(shape, query, parameters, renaming))
}
