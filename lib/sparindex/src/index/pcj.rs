use crate::algebra::{Expression, GraphPattern, TriplePattern};
use crate::error::{IndexEvaluationError, RewriteError};
use crate::index::{Binding, ExternalIndex, IndexShape, IndexSolutions};
use oxrdf::Variable;
use std::iter::once;
use std::sync::{Arc, RwLock};

/// A precomputed join stored in a [`PcjStorage`].
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct PcjDefinition {
    pub id: String,
    /// The query the rows are the solutions of.
    pub query: GraphPattern,
    pub cardinality: usize,
}

/// Storage of precomputed join (PCJ) definitions and rows.
pub trait PcjStorage: Send + Sync {
    fn definitions(&self) -> Result<Vec<PcjDefinition>, IndexEvaluationError>;

    /// The rows of a precomputed join, with the variables of its definition.
    fn rows(&self, id: &str) -> Result<Vec<Binding>, IndexEvaluationError>;
}

/// A [`PcjStorage`] kept in memory.
#[derive(Default)]
pub struct MemoryPcjStorage {
    tables: RwLock<Vec<(GraphPattern, String, Arc<[Binding]>)>>,
}

impl MemoryPcjStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a precomputed join, replacing the one with the same id.
    pub fn insert(&self, id: impl Into<String>, query: GraphPattern, rows: Vec<Binding>) {
        let id = id.into();
        let mut tables = match self.tables.write() {
            Ok(tables) => tables,
            Err(poisoned) => poisoned.into_inner(),
        };
        tables.retain(|(_, existing, _)| *existing != id);
        tables.push((query, id, rows.into()));
    }
}

impl PcjStorage for MemoryPcjStorage {
    fn definitions(&self) -> Result<Vec<PcjDefinition>, IndexEvaluationError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| IndexEvaluationError::new("the PCJ table lock is poisoned"))?;
        Ok(tables
            .iter()
            .map(|(query, id, rows)| PcjDefinition {
                id: id.clone(),
                query: query.clone(),
                cardinality: rows.len(),
            })
            .collect())
    }

    fn rows(&self, id: &str) -> Result<Vec<Binding>, IndexEvaluationError> {
        let tables = self
            .tables
            .read()
            .map_err(|_| IndexEvaluationError::new("the PCJ table lock is poisoned"))?;
        let (_, _, rows) = tables
            .iter()
            .find(|(_, existing, _)| existing == id)
            .ok_or_else(|| IndexEvaluationError::new(format!("the PCJ table {id} does not exist")))?;
        Ok(rows.to_vec())
    }
}

/// An index answering the basic graph pattern (and filters) of a precomputed join.
pub struct PcjIndex {
    id: String,
    binding_names: Vec<Variable>,
    shape: IndexShape,
    cardinality: usize,
    storage: Arc<dyn PcjStorage>,
}

impl PcjIndex {
    /// Builds the index shape from the definition query.
    ///
    /// The query must be made of triple patterns, joins and filters, optionally under a projection.
    pub fn new(
        definition: PcjDefinition,
        storage: Arc<dyn PcjStorage>,
    ) -> Result<Self, RewriteError> {
        let PcjDefinition {
            id,
            query,
            cardinality,
        } = definition;
        let (inner, projection) = match query {
            GraphPattern::Project { inner, variables } => (*inner, Some(variables)),
            query => (query, None),
        };
        let mut patterns = Vec::new();
        let mut filters = Vec::new();
        collect_bgp(&id, inner, &mut patterns, &mut filters)?;
        let binding_names = if let Some(projection) = projection {
            projection
        } else {
            let mut variables = Vec::new();
            for pattern in &patterns {
                for v in pattern.variables() {
                    if !variables.contains(v) {
                        variables.push(v.clone());
                    }
                }
            }
            variables
        };
        let shape = filters
            .into_iter()
            .fold(IndexShape::new(patterns), IndexShape::with_filter);
        shape.validate(&id, &binding_names)?;
        Ok(Self {
            id,
            binding_names,
            shape,
            cardinality,
            storage,
        })
    }
}

fn collect_bgp(
    id: &str,
    pattern: GraphPattern,
    patterns: &mut Vec<TriplePattern>,
    filters: &mut Vec<Expression>,
) -> Result<(), RewriteError> {
    match pattern {
        GraphPattern::Triple(pattern) => patterns.push(pattern),
        GraphPattern::Join { left, right } => {
            collect_bgp(id, *left, patterns, filters)?;
            collect_bgp(id, *right, patterns, filters)?;
        }
        GraphPattern::Filter { expression, inner } => {
            filters.push(expression);
            collect_bgp(id, *inner, patterns, filters)?;
        }
        GraphPattern::LeftJoin { .. } => {
            return Err(RewriteError::invalid_shape(
                id,
                "optional patterns are not supported in precomputed joins",
            ));
        }
        pattern => {
            return Err(RewriteError::invalid_shape(
                id,
                format!("{pattern} is not supported in precomputed joins"),
            ));
        }
    }
    Ok(())
}

impl ExternalIndex for PcjIndex {
    fn id(&self) -> &str {
        &self.id
    }

    fn binding_names(&self) -> &[Variable] {
        &self.binding_names
    }

    fn shape(&self) -> &IndexShape {
        &self.shape
    }

    fn cardinality(&self) -> usize {
        self.cardinality
    }

    fn evaluate(
        &self,
        input: &Binding,
        _patterns: &[usize],
    ) -> Result<IndexSolutions, IndexEvaluationError> {
        // Every pattern is required, and only the exposed columns are stored
        let input = input
            .iter()
            .filter(|(v, _)| self.binding_names.contains(v))
            .map(|(v, t)| (v.clone(), t.clone()))
            .collect::<Binding>();
        let storage = Arc::clone(&self.storage);
        let id = self.id.clone();
        Ok(IndexSolutions::new(move || {
            let rows: Box<dyn Iterator<Item = Result<Binding, IndexEvaluationError>> + Send> =
                match storage.rows(&id) {
                    Ok(rows) => {
                        let input = input.clone();
                        Box::new(
                            rows.into_iter()
                                .filter(move |row| input.is_compatible(row))
                                .map(Ok),
                        )
                    }
                    Err(e) => Box::new(once(Err(e))),
                };
            rows
        }))
    }
}

impl std::fmt::Debug for PcjIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PcjIndex")
            .field("id", &self.id)
            .field("binding_names", &self.binding_names)
            .field("shape", &self.shape)
            .field("cardinality", &self.cardinality)
            .finish_non_exhaustive()
    }
}
