use crate::algebra::{Expression, TriplePattern};
use crate::error::{IndexEvaluationError, RewriteError};
use crate::index::{Binding, ExternalIndex, IndexShape, IndexSolutions};
use oxrdf::vocab::xsd;
use oxrdf::{NamedNode, Term, Variable};
use rustc_hash::FxHashMap;
use std::fmt;
use std::iter::once;
use std::sync::{Arc, RwLock};

/// A filter function, with the calling convention of SPARQL custom functions.
///
/// It returns `None` on invalid arguments.
pub type CustomFunction = Arc<dyn Fn(&[Term]) -> Option<Term> + Send + Sync>;

/// Storage of statements searchable with filter functions, like geospatial, temporal or
/// free-text indices.
pub trait FunctionStorage: Send + Sync {
    /// Returns the `(subject, object)` pairs of the statements with `predicate` for which
    /// `function(object, arguments...)` is true.
    fn search(
        &self,
        predicate: &NamedNode,
        function: &NamedNode,
        arguments: &[Term],
    ) -> Result<Vec<(Term, Term)>, IndexEvaluationError>;

    /// Number of statements with `predicate`.
    fn count(&self, predicate: &NamedNode) -> Result<usize, IndexEvaluationError>;
}

/// A [`FunctionStorage`] kept in memory, evaluating the functions on every statement.
#[derive(Default)]
pub struct MemoryFunctionStorage {
    statements: RwLock<Vec<(Term, NamedNode, Term)>>,
    functions: FxHashMap<NamedNode, CustomFunction>,
}

impl MemoryFunctionStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function the storage can search with.
    #[must_use]
    pub fn with_function(
        mut self,
        name: NamedNode,
        evaluator: impl Fn(&[Term]) -> Option<Term> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name, Arc::new(evaluator));
        self
    }

    pub fn insert(&self, subject: impl Into<Term>, predicate: NamedNode, object: impl Into<Term>) {
        let mut statements = match self.statements.write() {
            Ok(statements) => statements,
            Err(poisoned) => poisoned.into_inner(),
        };
        statements.push((subject.into(), predicate, object.into()));
    }
}

impl FunctionStorage for MemoryFunctionStorage {
    fn search(
        &self,
        predicate: &NamedNode,
        function: &NamedNode,
        arguments: &[Term],
    ) -> Result<Vec<(Term, Term)>, IndexEvaluationError> {
        let evaluator = self
            .functions
            .get(function)
            .ok_or_else(|| IndexEvaluationError::new(format!("unknown search function {function}")))?;
        let statements = self
            .statements
            .read()
            .map_err(|_| IndexEvaluationError::new("the statement lock is poisoned"))?;
        let mut call = Vec::with_capacity(arguments.len() + 1);
        let mut found = Vec::new();
        for (subject, _, object) in statements.iter().filter(|(_, p, _)| p == predicate) {
            call.clear();
            call.push(object.clone());
            call.extend_from_slice(arguments);
            if evaluator(&call).as_ref().is_some_and(is_true) {
                found.push((subject.clone(), object.clone()));
            }
        }
        Ok(found)
    }

    fn count(&self, predicate: &NamedNode) -> Result<usize, IndexEvaluationError> {
        Ok(self
            .statements
            .read()
            .map_err(|_| IndexEvaluationError::new("the statement lock is poisoned"))?
            .iter()
            .filter(|(_, p, _)| p == predicate)
            .count())
    }
}

fn is_true(term: &Term) -> bool {
    matches!(term, Term::Literal(l) if l.datatype() == xsd::BOOLEAN && matches!(l.value(), "true" | "1"))
}

/// An index answering a statement pattern together with a filter function on its object.
///
/// Its shape is `?subject <predicate> ?object` with the filter
/// `<function>(?object, ?argument1, ...)`, the arguments matching constants of the query filter.
/// These constants are given to the [`FunctionStorage`] search.
pub struct FilterFunctionIndex {
    id: String,
    predicate: NamedNode,
    function: NamedNode,
    subject: Variable,
    object: Variable,
    arguments: Vec<Variable>,
    binding_names: Vec<Variable>,
    shape: IndexShape,
    cardinality: usize,
    storage: Arc<dyn FunctionStorage>,
}

impl FilterFunctionIndex {
    /// `arity` is the number of function arguments, the statement object included.
    pub fn new(
        id: impl Into<String>,
        predicate: NamedNode,
        function: NamedNode,
        arity: usize,
        storage: Arc<dyn FunctionStorage>,
    ) -> Result<Self, RewriteError> {
        let id = id.into();
        if arity == 0 {
            return Err(RewriteError::invalid_shape(
                id,
                format!("{function} must take the statement object as argument"),
            ));
        }
        let subject = Variable::new_unchecked("subject");
        let object = Variable::new_unchecked("object");
        let arguments = (1..arity)
            .map(|i| Variable::new_unchecked(format!("argument{i}")))
            .collect::<Vec<_>>();
        let filter = Expression::call(
            function.clone(),
            once(object.clone())
                .chain(arguments.iter().cloned())
                .map(Expression::from)
                .collect(),
        );
        let shape = arguments.iter().cloned().fold(
            IndexShape::new([TriplePattern::new(
                subject.clone(),
                predicate.clone(),
                object.clone(),
            )])
            .with_filter(filter),
            IndexShape::with_parameter,
        );
        let binding_names = vec![subject.clone(), object.clone()];
        shape.validate(&id, &binding_names)?;
        let cardinality = storage.count(&predicate)?;
        Ok(Self {
            id,
            predicate,
            function,
            subject,
            object,
            arguments,
            binding_names,
            shape,
            cardinality,
            storage,
        })
    }

    #[inline]
    pub fn function(&self) -> &NamedNode {
        &self.function
    }
}

impl ExternalIndex for FilterFunctionIndex {
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
        let arguments = self
            .arguments
            .iter()
            .map(|argument| {
                input.get(argument).cloned().ok_or_else(|| {
                    IndexEvaluationError::new(format!(
                        "the argument {argument} of {} is not bound",
                        self.function
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let storage = Arc::clone(&self.storage);
        let predicate = self.predicate.clone();
        let function = self.function.clone();
        let subject = self.subject.clone();
        let object = self.object.clone();
        let input = input.clone();
        Ok(IndexSolutions::new(move || {
            let solutions: Box<dyn Iterator<Item = Result<Binding, IndexEvaluationError>> + Send> =
                match storage.search(&predicate, &function, &arguments) {
                    Ok(found) => {
                        let (subject, object, input) =
                            (subject.clone(), object.clone(), input.clone());
                        Box::new(found.into_iter().filter_map(move |(s, o)| {
                            let solution = Binding::from_iter([
                                (subject.clone(), s),
                                (object.clone(), o),
                            ]);
                            input.is_compatible(&solution).then_some(Ok(solution))
                        }))
                    }
                    Err(e) => Box::new(once(Err(e))),
                };
            solutions
        }))
    }
}

impl fmt::Debug for FilterFunctionIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterFunctionIndex")
            .field("id", &self.id)
            .field("predicate", &self.predicate)
            .field("function", &self.function)
            .field("cardinality", &self.cardinality)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxrdf::Literal;

    fn iri(value: &str) -> NamedNode {
        NamedNode::new_unchecked(format!("http://example.com/{value}"))
    }

    fn starts_with(args: &[Term]) -> Option<Term> {
        let [Term::Literal(value), Term::Literal(prefix)] = args else {
            return None;
        };
        Some(Literal::from(value.value().starts_with(prefix.value())).into())
    }

    fn storage() -> Arc<MemoryFunctionStorage> {
        let storage = MemoryFunctionStorage::new().with_function(iri("startsWith"), starts_with);
        storage.insert(iri("alice"), iri("name"), Literal::from("Alice"));
        storage.insert(iri("albert"), iri("name"), Literal::from("Albert"));
        storage.insert(iri("bob"), iri("name"), Literal::from("Bob"));
        storage.insert(iri("alice"), iri("nick"), Literal::from("Al"));
        Arc::new(storage)
    }

    #[test]
    fn shape_has_a_parameter_per_argument() -> Result<(), RewriteError> {
        let index = FilterFunctionIndex::new("names", iri("name"), iri("startsWith"), 2, storage())?;
        assert_eq!(index.cardinality(), 3);
        assert_eq!(index.shape().patterns().len(), 1);
        assert_eq!(index.shape().filters().len(), 1);
        assert_eq!(index.shape().parameters(), [Variable::new_unchecked("argument1")]);
        assert!(
            FilterFunctionIndex::new("names", iri("name"), iri("startsWith"), 0, storage())
                .is_err()
        );
        Ok(())
    }

    #[test]
    fn search_with_the_arguments() -> Result<(), Box<dyn std::error::Error>> {
        let index = FilterFunctionIndex::new("names", iri("name"), iri("startsWith"), 2, storage())?;
        let input = Binding::from_iter([(
            Variable::new_unchecked("argument1"),
            Term::from(Literal::from("Al")),
        )]);
        let solutions = index.evaluate(&input, &[0])?;
        assert_eq!(solutions.iter().count(), 2);

        let mut alice = input.clone();
        alice.insert(Variable::new_unchecked("subject"), iri("alice"));
        assert_eq!(index.evaluate(&alice, &[0])?.iter().count(), 1);

        assert!(index.evaluate(&Binding::default(), &[0]).is_err());
        Ok(())
    }

    #[test]
    fn unknown_function_fails_at_evaluation() -> Result<(), Box<dyn std::error::Error>> {
        let index = FilterFunctionIndex::new("names", iri("name"), iri("endsWith"), 2, storage())?;
        let input = Binding::from_iter([(
            Variable::new_unchecked("argument1"),
            Term::from(Literal::from("e")),
        )]);
        let error = index
            .evaluate(&input, &[0])?
            .iter()
            .find_map(Result::err)
            .ok_or("no error")?;
        assert!(error.to_string().contains("endsWith"));
        Ok(())
    }
}
