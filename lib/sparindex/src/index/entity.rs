use crate::algebra::{TermPattern, TriplePattern};
use crate::error::{IndexEvaluationError, RewriteError};
use crate::index::{Binding, ExternalIndex, IndexShape, IndexSolutions};
use oxrdf::vocab::rdf;
use oxrdf::{NamedNode, Term, Variable};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// An entity type: a class and the properties its instances carry.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct Type {
    id: NamedNode,
    properties: Vec<NamedNode>,
}

impl Type {
    pub fn new(id: NamedNode, properties: impl IntoIterator<Item = NamedNode>) -> Self {
        Self {
            id,
            properties: properties.into_iter().collect(),
        }
    }

    #[inline]
    pub fn id(&self) -> &NamedNode {
        &self.id
    }

    #[inline]
    pub fn properties(&self) -> &[NamedNode] {
        &self.properties
    }

    #[inline]
    pub fn has_property(&self, property: &NamedNode) -> bool {
        self.properties.contains(property)
    }
}

/// An instance of a [`Type`] with its property values.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Entity {
    subject: NamedNode,
    properties: Vec<(NamedNode, Term)>,
}

impl Entity {
    pub fn new(subject: NamedNode) -> Self {
        Self {
            subject,
            properties: Vec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn with_property(mut self, property: NamedNode, value: impl Into<Term>) -> Self {
        self.properties.push((property, value.into()));
        self
    }

    #[inline]
    pub fn subject(&self) -> &NamedNode {
        &self.subject
    }

    pub fn values<'a>(&'a self, property: &'a NamedNode) -> impl Iterator<Item = &'a Term> + 'a {
        self.properties
            .iter()
            .filter(move |(p, _)| p == property)
            .map(|(_, v)| v)
    }
}

/// Storage of entities grouped by type.
pub trait EntityStorage: Send + Sync {
    fn get(
        &self,
        r#type: &NamedNode,
        subject: &NamedNode,
    ) -> Result<Option<Entity>, IndexEvaluationError>;

    fn search(&self, r#type: &NamedNode) -> Result<Vec<Entity>, IndexEvaluationError>;

    fn count(&self, r#type: &NamedNode) -> Result<usize, IndexEvaluationError>;
}

/// An [`EntityStorage`] kept in memory.
#[derive(Default)]
pub struct MemoryEntityStorage {
    entities: RwLock<FxHashMap<NamedNode, Vec<Entity>>>,
}

impl MemoryEntityStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an entity of the given type, replacing the one with the same subject.
    pub fn insert(&self, r#type: NamedNode, entity: Entity) {
        let mut entities = match self.entities.write() {
            Ok(entities) => entities,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entities = entities.entry(r#type).or_default();
        entities.retain(|e| e.subject != entity.subject);
        entities.push(entity);
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, FxHashMap<NamedNode, Vec<Entity>>>, IndexEvaluationError>
    {
        self.entities
            .read()
            .map_err(|_| IndexEvaluationError::new("the entity storage lock is poisoned"))
    }
}

impl EntityStorage for MemoryEntityStorage {
    fn get(
        &self,
        r#type: &NamedNode,
        subject: &NamedNode,
    ) -> Result<Option<Entity>, IndexEvaluationError> {
        Ok(self
            .read()?
            .get(r#type)
            .and_then(|entities| entities.iter().find(|e| e.subject == *subject))
            .cloned())
    }

    fn search(&self, r#type: &NamedNode) -> Result<Vec<Entity>, IndexEvaluationError> {
        Ok(self.read()?.get(r#type).cloned().unwrap_or_default())
    }

    fn count(&self, r#type: &NamedNode) -> Result<usize, IndexEvaluationError> {
        Ok(self.read()?.get(r#type).map_or(0, Vec::len))
    }
}

/// An index over the entities of a [`Type`].
///
/// Its shape is a star around the entity subject: the `rdf:type` pattern is required,
/// the property patterns are consumed when the query contains them.
/// Only the property patterns a substitution replaces restrict and bind the solutions.
pub struct EntityIndex {
    id: String,
    r#type: Type,
    subject: Variable,
    /// property -> value pattern, the column `i` is the shape pattern `i + 1`
    columns: Vec<(NamedNode, TermPattern)>,
    binding_names: Vec<Variable>,
    shape: IndexShape,
    cardinality: usize,
    storage: Arc<dyn EntityStorage>,
}

impl EntityIndex {
    /// Builds an index covering every property of the type.
    pub fn new(
        id: impl Into<String>,
        r#type: Type,
        storage: Arc<dyn EntityStorage>,
    ) -> Result<Self, RewriteError> {
        let subject = Variable::new_unchecked("subject");
        let mut patterns = vec![TriplePattern::new(
            subject.clone(),
            rdf::TYPE,
            r#type.id().clone(),
        )];
        for (i, property) in r#type.properties().iter().enumerate() {
            patterns.push(TriplePattern::new(
                subject.clone(),
                property.clone(),
                Variable::new_unchecked(format!("property{i}")),
            ));
        }
        Self::from_patterns(id, r#type, patterns, storage)
    }

    /// Builds an index from a star of patterns around a single subject.
    ///
    /// The patterns must share their subject, have IRI predicates, contain exactly one
    /// `rdf:type` pattern naming `type` and only use properties of `type`.
    pub fn from_patterns(
        id: impl Into<String>,
        r#type: Type,
        patterns: Vec<TriplePattern>,
        storage: Arc<dyn EntityStorage>,
    ) -> Result<Self, RewriteError> {
        let id = id.into();
        let Some(TermPattern::Variable(subject)) = patterns.first().map(|p| p.subject.clone())
        else {
            return Err(RewriteError::invalid_shape(
                id,
                "the entity patterns must have a variable subject",
            ));
        };
        let mut type_pattern = None;
        let mut columns = Vec::new();
        for pattern in patterns {
            if pattern.subject != TermPattern::Variable(subject.clone()) {
                return Err(RewriteError::invalid_shape(
                    id,
                    format!("{pattern} does not have the subject {subject}"),
                ));
            }
            let TermPattern::NamedNode(predicate) = &pattern.predicate else {
                return Err(RewriteError::invalid_shape(
                    id,
                    format!("the predicate of {pattern} is not an IRI"),
                ));
            };
            if *predicate == rdf::TYPE {
                if pattern.object != TermPattern::NamedNode(r#type.id().clone()) {
                    return Err(RewriteError::invalid_shape(
                        id,
                        format!("{pattern} does not define the type {}", r#type.id()),
                    ));
                }
                if type_pattern.replace(pattern).is_some() {
                    return Err(RewriteError::invalid_shape(
                        id,
                        "the entity patterns define the type twice",
                    ));
                }
            } else if r#type.has_property(predicate) {
                columns.push((predicate.clone(), pattern.object.clone()));
            } else {
                return Err(RewriteError::invalid_shape(
                    id,
                    format!("{predicate} is not a property of {}", r#type.id()),
                ));
            }
        }
        let Some(type_pattern) = type_pattern else {
            return Err(RewriteError::invalid_shape(
                id,
                format!("no pattern defines the type {}", r#type.id()),
            ));
        };
        let mut binding_names = vec![subject.clone()];
        for (_, value) in &columns {
            if let TermPattern::Variable(v) = value {
                if !binding_names.contains(v) {
                    binding_names.push(v.clone());
                }
            }
        }
        let shape = columns
            .iter()
            .map(|(property, value)| {
                TriplePattern::new(subject.clone(), property.clone(), value.clone())
            })
            .fold(
                IndexShape::new([type_pattern]).with_type_requirement(r#type.id().clone()),
                IndexShape::with_optional_pattern,
            );
        shape.validate(&id, &binding_names)?;
        let cardinality = storage.count(r#type.id())?;
        Ok(Self {
            id,
            r#type,
            subject,
            columns,
            binding_names,
            shape,
            cardinality,
            storage,
        })
    }

    #[inline]
    pub fn entity_type(&self) -> &Type {
        &self.r#type
    }
}

impl ExternalIndex for EntityIndex {
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
        patterns: &[usize],
    ) -> Result<IndexSolutions, IndexEvaluationError> {
        let lookup = EntityLookup {
            r#type: self.r#type.id().clone(),
            subject: self.subject.clone(),
            columns: self
                .columns
                .iter()
                .enumerate()
                .filter(|(i, _)| patterns.contains(&(i + 1)))
                .map(|(_, column)| column.clone())
                .collect(),
            input: input.clone(),
            storage: Arc::clone(&self.storage),
        };
        Ok(IndexSolutions::new(move || {
            let solutions = match lookup.solutions() {
                Ok(solutions) => solutions.into_iter().map(Ok).collect::<Vec<_>>(),
                Err(e) => vec![Err(e)],
            };
            solutions.into_iter()
        }))
    }
}

impl fmt::Debug for EntityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityIndex")
            .field("id", &self.id)
            .field("type", &self.r#type)
            .field("shape", &self.shape)
            .field("cardinality", &self.cardinality)
            .finish_non_exhaustive()
    }
}

struct EntityLookup {
    r#type: NamedNode,
    subject: Variable,
    columns: Vec<(NamedNode, TermPattern)>,
    input: Binding,
    storage: Arc<dyn EntityStorage>,
}

impl EntityLookup {
    fn solutions(&self) -> Result<Vec<Binding>, IndexEvaluationError> {
        let entities = match self.input.get(&self.subject) {
            Some(Term::NamedNode(subject)) => self
                .storage
                .get(&self.r#type, subject)?
                .into_iter()
                .collect(),
            Some(_) => Vec::new(),
            None => self.storage.search(&self.r#type)?,
        };
        let mut solutions = Vec::new();
        for entity in entities {
            let mut rows = vec![Binding::from_iter([(
                self.subject.clone(),
                Term::from(entity.subject().clone()),
            )])];
            for (property, value) in &self.columns {
                rows = match value {
                    TermPattern::Variable(variable) => {
                        let expected = self.input.get(variable);
                        let values = entity
                            .values(property)
                            .filter(|v| expected.is_none_or(|e| e == *v))
                            .collect::<Vec<_>>();
                        rows.into_iter()
                            .flat_map(|row| {
                                values.iter().filter_map(move |v| {
                                    let mut row = row.clone();
                                    match row.get(variable) {
                                        Some(existing) if existing != *v => None,
                                        Some(_) => Some(row),
                                        None => {
                                            row.insert(variable.clone(), (*v).clone());
                                            Some(row)
                                        }
                                    }
                                })
                            })
                            .collect()
                    }
                    constant => {
                        let constant = constant.to_term();
                        if entity.values(property).any(|v| Some(v) == constant.as_ref()) {
                            rows
                        } else {
                            Vec::new()
                        }
                    }
                };
            }
            solutions.extend(rows);
        }
        Ok(solutions)
    }
}
