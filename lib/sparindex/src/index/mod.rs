//! External indices and the catalogue the planner draws them from.

mod entity;
mod function;
mod pcj;

use crate::algebra::{Expression, TermPattern, TriplePattern};
use crate::error::RewriteError;
pub use crate::error::IndexEvaluationError;
pub use entity::{Entity, EntityIndex, EntityStorage, MemoryEntityStorage, Type};
pub use function::{
    CustomFunction, FilterFunctionIndex, FunctionStorage, MemoryFunctionStorage,
};
use oxrdf::vocab::rdf;
use oxrdf::{NamedNode, Term, Variable};
pub use pcj::{MemoryPcjStorage, PcjDefinition, PcjIndex, PcjStorage};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::iter::empty;
use std::sync::Arc;
use tracing::debug;

/// A secondary index that may answer a group of triple patterns with a single lookup.
///
/// Implementations are shared between planning passes and concurrent query executions:
/// [`evaluate`](Self::evaluate) takes `&self` and must not keep a shared cursor.
pub trait ExternalIndex: Send + Sync + fmt::Debug {
    /// Unique identifier of the index in the catalogue.
    fn id(&self) -> &str;

    /// The index variables the index returns values for.
    fn binding_names(&self) -> &[Variable];

    /// The patterns the index is able to answer, with its own variable names.
    fn shape(&self) -> &IndexShape;

    /// Estimated number of solutions of the index.
    fn cardinality(&self) -> usize;

    /// Returns the solutions compatible with `input`.
    ///
    /// `input` and the returned bindings use the index variable names.
    /// `patterns` are the sorted positions in the [`shape`](Self::shape) of the patterns being
    /// replaced. The other shape patterns must neither restrict nor multiply the solutions.
    fn evaluate(
        &self,
        input: &Binding,
        patterns: &[usize],
    ) -> Result<IndexSolutions, IndexEvaluationError>;
}

/// A partial assignment of RDF terms to variables.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct Binding {
    values: FxHashMap<Variable, Term>,
}

impl Binding {
    #[inline]
    pub fn get(&self, variable: &Variable) -> Option<&Term> {
        self.values.get(variable)
    }

    #[inline]
    pub fn insert(&mut self, variable: Variable, value: impl Into<Term>) -> Option<Term> {
        self.values.insert(variable, value.into())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Variable, &Term)> {
        self.values.iter()
    }

    /// Do the two bindings agree on every variable they both bind?
    pub fn is_compatible(&self, other: &Self) -> bool {
        self.values
            .iter()
            .all(|(variable, value)| other.get(variable).is_none_or(|v| v == value))
    }
}

impl FromIterator<(Variable, Term)> for Binding {
    fn from_iter<T: IntoIterator<Item = (Variable, Term)>>(iter: T) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

type SolutionIter = Box<dyn Iterator<Item = Result<Binding, IndexEvaluationError>> + Send>;

/// A lazy, finite and restartable sequence of solutions of an [`ExternalIndex`].
///
/// Each call to [`iter`](Self::iter) starts a new independent pass.
#[derive(Clone)]
pub struct IndexSolutions {
    factory: Arc<dyn Fn() -> SolutionIter + Send + Sync>,
}

impl IndexSolutions {
    pub fn new<I: Iterator<Item = Result<Binding, IndexEvaluationError>> + Send + 'static>(
        factory: impl Fn() -> I + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Arc::new(move || -> SolutionIter { Box::new(factory()) }),
        }
    }

    pub fn empty() -> Self {
        Self::new(empty)
    }

    /// Solutions already in memory.
    pub fn from_bindings(bindings: Vec<Binding>) -> Self {
        let bindings = Arc::new(bindings);
        Self::new(move || {
            let bindings = Arc::clone(&bindings);
            (0..bindings.len()).map(move |i| Ok(bindings[i].clone()))
        })
    }

    pub fn iter(&self) -> SolutionIter {
        (self.factory)()
    }
}

impl fmt::Debug for IndexSolutions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexSolutions").finish_non_exhaustive()
    }
}

/// A pattern of an [`IndexShape`].
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct ShapePattern {
    pub pattern: TriplePattern,
    /// Optional patterns are consumed only when the query contains them.
    pub required: bool,
}

/// Must the shape patterns match query patterns in the same order?
#[derive(Eq, PartialEq, Debug, Clone, Copy, Hash, Default)]
pub enum ShapeOrder {
    #[default]
    Unordered,
    Ordered,
}

/// The description of what an [`ExternalIndex`] answers.
#[derive(Eq, PartialEq, Debug, Clone, Default)]
pub struct IndexShape {
    patterns: Vec<ShapePattern>,
    order: ShapeOrder,
    type_requirement: Option<NamedNode>,
    filters: Vec<Expression>,
    parameters: Vec<Variable>,
}

impl IndexShape {
    /// An unordered shape where all patterns are required.
    pub fn new(patterns: impl IntoIterator<Item = TriplePattern>) -> Self {
        Self {
            patterns: patterns
                .into_iter()
                .map(|pattern| ShapePattern {
                    pattern,
                    required: true,
                })
                .collect(),
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub fn with_optional_pattern(mut self, pattern: TriplePattern) -> Self {
        self.patterns.push(ShapePattern {
            pattern,
            required: false,
        });
        self
    }

    #[inline]
    #[must_use]
    pub fn with_order(mut self, order: ShapeOrder) -> Self {
        self.order = order;
        self
    }

    /// Requires a `?s rdf:type <class>` pattern among the consumed patterns.
    #[inline]
    #[must_use]
    pub fn with_type_requirement(mut self, class: NamedNode) -> Self {
        self.type_requirement = Some(class);
        self
    }

    /// Adds a filter the index applies internally.
    #[inline]
    #[must_use]
    pub fn with_filter(mut self, filter: Expression) -> Self {
        self.filters.extend(filter.into_conjuncts());
        self
    }

    /// Declares a variable of the filters that is not bound by the patterns.
    ///
    /// It matches a constant of the query filter, given to the index as evaluation input.
    #[inline]
    #[must_use]
    pub fn with_parameter(mut self, parameter: Variable) -> Self {
        self.parameters.push(parameter);
        self
    }

    #[inline]
    pub fn patterns(&self) -> &[ShapePattern] {
        &self.patterns
    }

    #[inline]
    pub fn required_pattern_count(&self) -> usize {
        self.patterns.iter().filter(|p| p.required).count()
    }

    #[inline]
    pub fn order(&self) -> ShapeOrder {
        self.order
    }

    #[inline]
    pub fn type_requirement(&self) -> Option<&NamedNode> {
        self.type_requirement.as_ref()
    }

    #[inline]
    pub fn filters(&self) -> &[Expression] {
        &self.filters
    }

    #[inline]
    pub fn parameters(&self) -> &[Variable] {
        &self.parameters
    }

    /// Checks that the shape can be substituted soundly for query patterns.
    pub fn validate(&self, index: &str, binding_names: &[Variable]) -> Result<(), RewriteError> {
        if self.required_pattern_count() == 0 {
            return Err(RewriteError::invalid_shape(
                index,
                "the shape has no required pattern",
            ));
        }
        let mut variables = FxHashSet::default();
        for ShapePattern { pattern, .. } in &self.patterns {
            if !matches!(pattern.predicate, TermPattern::NamedNode(_)) {
                return Err(RewriteError::invalid_shape(
                    index,
                    format!("the predicate of {pattern} is not an IRI"),
                ));
            }
            variables.extend(pattern.variables());
        }
        if let Some(variable) = binding_names.iter().find(|v| !variables.contains(v)) {
            return Err(RewriteError::invalid_shape(
                index,
                format!("the exposed variable {variable} is not in the shape"),
            ));
        }
        if let Some(parameter) = self.parameters.iter().find(|p| variables.contains(p)) {
            return Err(RewriteError::invalid_shape(
                index,
                format!("the parameter {parameter} is also bound by a pattern"),
            ));
        }
        if let Some(parameter) = self.parameters.iter().find(|p| {
            !self
                .filters
                .iter()
                .any(|filter| filter.used_variables().contains(p))
        }) {
            return Err(RewriteError::invalid_shape(
                index,
                format!("the parameter {parameter} is not used by any filter"),
            ));
        }
        for filter in &self.filters {
            if let Some(variable) = filter
                .used_variables()
                .into_iter()
                .find(|v| !variables.contains(v) && !self.parameters.contains(v))
            {
                return Err(RewriteError::invalid_shape(
                    index,
                    format!("the filter {filter} uses {variable} that is not in the shape"),
                ));
            }
        }
        if let Some(class) = &self.type_requirement {
            if !self.patterns.iter().any(|p| {
                p.required
                    && p.pattern.predicate == TermPattern::NamedNode(rdf::TYPE.into())
                    && p.pattern.object == TermPattern::NamedNode(class.clone())
            }) {
                return Err(RewriteError::invalid_shape(
                    index,
                    format!("the type {class} is required but no required pattern defines it"),
                ));
            }
        }
        Ok(())
    }
}

/// The immutable set of external indices available during a planning pass.
#[derive(Debug, Clone, Default)]
pub struct IndexCatalogue {
    indices: Vec<Arc<dyn ExternalIndex>>,
}

impl IndexCatalogue {
    /// Validates the shape of every index.
    pub fn new(
        indices: impl IntoIterator<Item = Arc<dyn ExternalIndex>>,
    ) -> Result<Self, RewriteError> {
        let indices = indices.into_iter().collect::<Vec<_>>();
        for index in &indices {
            index.shape().validate(index.id(), index.binding_names())?;
        }
        debug!(indices = indices.len(), "index catalogue built");
        Ok(Self { indices })
    }

    /// Builds a [`PcjIndex`] for every precomputed join of the storage.
    pub fn from_pcj_storage(storage: Arc<dyn PcjStorage>) -> Result<Self, RewriteError> {
        let definitions = storage.definitions()?;
        if definitions.is_empty() {
            debug!("no precomputed join found in the storage");
        }
        Self::new(
            definitions
                .into_iter()
                .map(|definition| {
                    let index: Arc<dyn ExternalIndex> =
                        Arc::new(PcjIndex::new(definition, Arc::clone(&storage))?);
                    Ok(index)
                })
                .collect::<Result<Vec<_>, RewriteError>>()?,
        )
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn ExternalIndex>> {
        self.indices.iter()
    }
}
