//! Query tree model rewritten by the planner.
//!
//! Trees are immutable values: every rewrite builds a new tree and unmodified sub-trees are
//! simply cloned into the alternatives that share them.

use crate::index::{Binding, ExternalIndex, IndexEvaluationError, IndexSolutions};
use oxrdf::vocab::{rdf, xsd};
pub use oxrdf::{Literal, NamedNode, NamedNodeRef, Term, Variable};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A term of a [`TriplePattern`]: a constant RDF term or a variable.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum TermPattern {
    NamedNode(NamedNode),
    Literal(Literal),
    Variable(Variable),
}

impl TermPattern {
    #[inline]
    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Variable(_))
    }

    #[inline]
    pub fn as_variable(&self) -> Option<&Variable> {
        if let Self::Variable(v) = self {
            Some(v)
        } else {
            None
        }
    }

    /// Returns the constant RDF term if this pattern is not a variable.
    pub fn to_term(&self) -> Option<Term> {
        match self {
            Self::NamedNode(node) => Some(node.clone().into()),
            Self::Literal(literal) => Some(literal.clone().into()),
            Self::Variable(_) => None,
        }
    }
}

impl fmt::Display for TermPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NamedNode(node) => node.fmt(f),
            Self::Literal(literal) => literal.fmt(f),
            Self::Variable(variable) => variable.fmt(f),
        }
    }
}

impl From<NamedNode> for TermPattern {
    #[inline]
    fn from(node: NamedNode) -> Self {
        Self::NamedNode(node)
    }
}

impl From<NamedNodeRef<'_>> for TermPattern {
    #[inline]
    fn from(node: NamedNodeRef<'_>) -> Self {
        Self::NamedNode(node.into_owned())
    }
}

impl From<Literal> for TermPattern {
    #[inline]
    fn from(literal: Literal) -> Self {
        Self::Literal(literal)
    }
}

impl From<Variable> for TermPattern {
    #[inline]
    fn from(variable: Variable) -> Self {
        Self::Variable(variable)
    }
}

/// A subject/predicate/object pattern, optionally scoped to a named graph (the context).
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub struct TriplePattern {
    pub subject: TermPattern,
    pub predicate: TermPattern,
    pub object: TermPattern,
    /// `None` is the default graph.
    pub graph_name: Option<TermPattern>,
}

impl TriplePattern {
    #[inline]
    pub fn new(
        subject: impl Into<TermPattern>,
        predicate: impl Into<TermPattern>,
        object: impl Into<TermPattern>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            graph_name: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn in_graph(mut self, graph_name: impl Into<TermPattern>) -> Self {
        self.graph_name = Some(graph_name.into());
        self
    }

    /// Iterates over the four positions, the context last when it is set.
    pub fn terms(&self) -> impl Iterator<Item = &TermPattern> {
        [&self.subject, &self.predicate, &self.object]
            .into_iter()
            .chain(self.graph_name.as_ref())
    }

    /// The variables this pattern introduces, each one reported once.
    pub fn variables(&self) -> Vec<&Variable> {
        let mut variables = Vec::with_capacity(4);
        for v in self.terms().filter_map(TermPattern::as_variable) {
            if !variables.contains(&v) {
                variables.push(v);
            }
        }
        variables
    }

    /// Is it a `?s rdf:type <class>` pattern?
    pub fn type_constant(&self) -> Option<&NamedNode> {
        match (&self.predicate, &self.object) {
            (TermPattern::NamedNode(p), TermPattern::NamedNode(class)) if *p == rdf::TYPE => {
                Some(class)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(graph_name) = &self.graph_name {
            write!(
                f,
                "(quad {} {} {} {})",
                self.subject, self.predicate, self.object, graph_name
            )
        } else {
            write!(
                f,
                "(triple {} {} {})",
                self.subject, self.predicate, self.object
            )
        }
    }
}

/// A filter condition.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum Expression {
    NamedNode(NamedNode),
    Literal(Literal),
    Variable(Variable),
    /// [Logical-or](https://www.w3.org/TR/sparql11-query/#func-logical-or).
    Or(Vec<Self>),
    /// [Logical-and](https://www.w3.org/TR/sparql11-query/#func-logical-and).
    And(Vec<Self>),
    /// [RDFterm-equal](https://www.w3.org/TR/sparql11-query/#func-RDFterm-equal) and all the XSD equalities.
    Equal(Box<Self>, Box<Self>),
    /// [sameTerm](https://www.w3.org/TR/sparql11-query/#func-sameTerm).
    SameTerm(Box<Self>, Box<Self>),
    Greater(Box<Self>, Box<Self>),
    GreaterOrEqual(Box<Self>, Box<Self>),
    Less(Box<Self>, Box<Self>),
    LessOrEqual(Box<Self>, Box<Self>),
    Add(Box<Self>, Box<Self>),
    Subtract(Box<Self>, Box<Self>),
    Multiply(Box<Self>, Box<Self>),
    Divide(Box<Self>, Box<Self>),
    /// [fn:not](https://www.w3.org/TR/xpath-functions-31/#func-not).
    Not(Box<Self>),
    /// [BOUND](https://www.w3.org/TR/sparql11-query/#func-bound).
    Bound(Variable),
    /// A function call, geospatial, temporal and free-text functions included.
    FunctionCall(NamedNode, Vec<Self>),
}

impl Expression {
    /// Conjunction of all the arguments, nested conjunctions are flattened.
    pub fn and_all(args: impl IntoIterator<Item = Self>) -> Self {
        let mut all = Vec::new();
        for arg in args {
            if arg.effective_boolean_value() == Some(true) {
                continue;
            }
            if let Self::And(inner) = arg {
                all.extend(inner);
            } else {
                all.push(arg);
            }
        }
        match all.len() {
            0 => true.into(),
            1 => all.swap_remove(0),
            _ => Self::And(all),
        }
    }

    pub fn or_all(args: impl IntoIterator<Item = Self>) -> Self {
        let mut all = Vec::new();
        for arg in args {
            if let Self::Or(inner) = arg {
                all.extend(inner);
            } else {
                all.push(arg);
            }
        }
        match all.len() {
            0 => false.into(),
            1 => all.swap_remove(0),
            _ => Self::Or(all),
        }
    }

    pub fn equal(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::Equal(Box::new(left.into()), Box::new(right.into()))
    }

    pub fn same_term(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::SameTerm(Box::new(left.into()), Box::new(right.into()))
    }

    pub fn greater(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::Greater(Box::new(left.into()), Box::new(right.into()))
    }

    pub fn greater_or_equal(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::GreaterOrEqual(Box::new(left.into()), Box::new(right.into()))
    }

    pub fn less(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::Less(Box::new(left.into()), Box::new(right.into()))
    }

    pub fn less_or_equal(left: impl Into<Self>, right: impl Into<Self>) -> Self {
        Self::LessOrEqual(Box::new(left.into()), Box::new(right.into()))
    }

    pub fn call(name: NamedNode, args: Vec<Self>) -> Self {
        Self::FunctionCall(name, args)
    }

    pub fn effective_boolean_value(&self) -> Option<bool> {
        if let Self::Literal(literal) = self {
            if literal.datatype() == xsd::BOOLEAN {
                return match literal.value() {
                    "true" | "1" => Some(true),
                    "false" | "0" => Some(false),
                    _ => None,
                };
            }
        }
        None
    }

    /// Splits a conjunction into its conjuncts.
    pub fn into_conjuncts(self) -> Vec<Self> {
        if let Self::And(inner) = self {
            inner.into_iter().flat_map(Self::into_conjuncts).collect()
        } else {
            vec![self]
        }
    }

    pub fn lookup_used_variables<'a>(&'a self, callback: &mut impl FnMut(&'a Variable)) {
        match self {
            Self::NamedNode(_) | Self::Literal(_) => {}
            Self::Variable(v) | Self::Bound(v) => callback(v),
            Self::Or(inner) | Self::And(inner) | Self::FunctionCall(_, inner) => {
                for i in inner {
                    i.lookup_used_variables(callback);
                }
            }
            Self::Equal(a, b)
            | Self::SameTerm(a, b)
            | Self::Greater(a, b)
            | Self::GreaterOrEqual(a, b)
            | Self::Less(a, b)
            | Self::LessOrEqual(a, b)
            | Self::Add(a, b)
            | Self::Subtract(a, b)
            | Self::Multiply(a, b)
            | Self::Divide(a, b) => {
                a.lookup_used_variables(callback);
                b.lookup_used_variables(callback);
            }
            Self::Not(e) => e.lookup_used_variables(callback),
        }
    }

    /// The set of variables referenced by the expression.
    pub fn used_variables(&self) -> FxHashSet<&Variable> {
        let mut variables = FxHashSet::default();
        self.lookup_used_variables(&mut |v| {
            variables.insert(v);
        });
        variables
    }

    /// Substitutes variables using `renaming`.
    ///
    /// Returns `None` if a variable has no image or if a `BOUND` argument would become a constant.
    pub fn rename(&self, renaming: &FxHashMap<Variable, TermPattern>) -> Option<Self> {
        let binary = |a: &Self, b: &Self| -> Option<(Box<Self>, Box<Self>)> {
            Some((Box::new(a.rename(renaming)?), Box::new(b.rename(renaming)?)))
        };
        Some(match self {
            Self::NamedNode(_) | Self::Literal(_) => self.clone(),
            Self::Variable(v) => renaming.get(v)?.clone().into(),
            Self::Bound(v) => Self::Bound(renaming.get(v)?.as_variable()?.clone()),
            Self::Or(inner) => Self::Or(
                inner
                    .iter()
                    .map(|e| e.rename(renaming))
                    .collect::<Option<_>>()?,
            ),
            Self::And(inner) => Self::And(
                inner
                    .iter()
                    .map(|e| e.rename(renaming))
                    .collect::<Option<_>>()?,
            ),
            Self::FunctionCall(name, args) => Self::FunctionCall(
                name.clone(),
                args.iter()
                    .map(|e| e.rename(renaming))
                    .collect::<Option<_>>()?,
            ),
            Self::Equal(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Equal(a, b)
            }
            Self::SameTerm(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::SameTerm(a, b)
            }
            Self::Greater(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Greater(a, b)
            }
            Self::GreaterOrEqual(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::GreaterOrEqual(a, b)
            }
            Self::Less(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Less(a, b)
            }
            Self::LessOrEqual(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::LessOrEqual(a, b)
            }
            Self::Add(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Add(a, b)
            }
            Self::Subtract(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Subtract(a, b)
            }
            Self::Multiply(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Multiply(a, b)
            }
            Self::Divide(a, b) => {
                let (a, b) = binary(a, b)?;
                Self::Divide(a, b)
            }
            Self::Not(e) => Self::Not(Box::new(e.rename(renaming)?)),
        })
    }
}

impl From<NamedNode> for Expression {
    fn from(value: NamedNode) -> Self {
        Self::NamedNode(value)
    }
}

impl From<Literal> for Expression {
    fn from(value: Literal) -> Self {
        Self::Literal(value)
    }
}

impl From<Variable> for Expression {
    fn from(value: Variable) -> Self {
        Self::Variable(value)
    }
}

impl From<bool> for Expression {
    fn from(value: bool) -> Self {
        Literal::from(value).into()
    }
}

impl From<i64> for Expression {
    fn from(value: i64) -> Self {
        Literal::from(value).into()
    }
}

impl From<TermPattern> for Expression {
    fn from(value: TermPattern) -> Self {
        match value {
            TermPattern::NamedNode(node) => node.into(),
            TermPattern::Literal(literal) => literal.into(),
            TermPattern::Variable(variable) => variable.into(),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, inner: &[Expression]) -> fmt::Result {
            write!(f, "({name}")?;
            for e in inner {
                write!(f, " {e}")?;
            }
            f.write_str(")")
        }

        match self {
            Self::NamedNode(node) => node.fmt(f),
            Self::Literal(literal) => literal.fmt(f),
            Self::Variable(variable) => variable.fmt(f),
            Self::Or(inner) => list(f, "||", inner),
            Self::And(inner) => list(f, "&&", inner),
            Self::Equal(a, b) => write!(f, "(= {a} {b})"),
            Self::SameTerm(a, b) => write!(f, "(sameTerm {a} {b})"),
            Self::Greater(a, b) => write!(f, "(> {a} {b})"),
            Self::GreaterOrEqual(a, b) => write!(f, "(>= {a} {b})"),
            Self::Less(a, b) => write!(f, "(< {a} {b})"),
            Self::LessOrEqual(a, b) => write!(f, "(<= {a} {b})"),
            Self::Add(a, b) => write!(f, "(+ {a} {b})"),
            Self::Subtract(a, b) => write!(f, "(- {a} {b})"),
            Self::Multiply(a, b) => write!(f, "(* {a} {b})"),
            Self::Divide(a, b) => write!(f, "(/ {a} {b})"),
            Self::Not(e) => write!(f, "(! {e})"),
            Self::Bound(v) => write!(f, "(bound {v})"),
            Self::FunctionCall(name, args) => list(f, name.as_str(), args),
        }
    }
}

/// A node of the query tree.
#[derive(Eq, PartialEq, Debug, Clone, Hash)]
pub enum GraphPattern {
    Triple(TriplePattern),
    /// [Join](https://www.w3.org/TR/sparql11-query/#defn_algJoin).
    Join { left: Box<Self>, right: Box<Self> },
    /// [LeftJoin](https://www.w3.org/TR/sparql11-query/#defn_algLeftJoin), i.e. `OPTIONAL`.
    ///
    /// The right side may fail to bind without eliminating the left side solutions.
    LeftJoin {
        left: Box<Self>,
        right: Box<Self>,
        expression: Option<Expression>,
    },
    /// [Filter](https://www.w3.org/TR/sparql11-query/#defn_algFilter).
    Filter {
        expression: Expression,
        inner: Box<Self>,
    },
    /// [Union](https://www.w3.org/TR/sparql11-query/#defn_algUnion).
    Union { left: Box<Self>, right: Box<Self> },
    /// [Project](https://www.w3.org/TR/sparql11-query/#defn_algProjection).
    Project {
        inner: Box<Self>,
        variables: Vec<Variable>,
    },
    /// [Distinct](https://www.w3.org/TR/sparql11-query/#defn_algDistinct).
    Distinct { inner: Box<Self> },
    /// A lookup in an external index replacing some triple patterns.
    ExternalIndex(ExternalIndexNode),
}

impl GraphPattern {
    pub fn join(left: Self, right: Self) -> Self {
        Self::Join {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    /// Left-deep join of all the patterns, `None` if there is none.
    pub fn join_all(patterns: impl IntoIterator<Item = Self>) -> Option<Self> {
        patterns.into_iter().reduce(Self::join)
    }

    pub fn left_join(left: Self, right: Self, expression: Option<Expression>) -> Self {
        Self::LeftJoin {
            left: Box::new(left),
            right: Box::new(right),
            expression,
        }
    }

    pub fn filter(inner: Self, expression: Expression) -> Self {
        if expression.effective_boolean_value() == Some(true) {
            return inner;
        }
        match inner {
            Self::Filter {
                inner: nested_inner,
                expression: e2,
            } => Self::Filter {
                inner: nested_inner,
                expression: Expression::and_all([e2, expression]),
            },
            _ => Self::Filter {
                inner: Box::new(inner),
                expression,
            },
        }
    }

    pub fn union(left: Self, right: Self) -> Self {
        Self::Union {
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    pub fn project(inner: Self, variables: Vec<Variable>) -> Self {
        Self::Project {
            inner: Box::new(inner),
            variables,
        }
    }

    pub fn distinct(inner: Self) -> Self {
        Self::Distinct {
            inner: Box::new(inner),
        }
    }

    /// Is it a node where segment extraction starts (join, filter or optional)?
    #[inline]
    pub fn is_boundary(&self) -> bool {
        matches!(
            self,
            Self::Join { .. } | Self::Filter { .. } | Self::LeftJoin { .. }
        )
    }

    pub fn contains_left_join(&self) -> bool {
        match self {
            Self::LeftJoin { .. } => true,
            Self::Join { left, right } | Self::Union { left, right } => {
                left.contains_left_join() || right.contains_left_join()
            }
            Self::Filter { inner, .. } | Self::Project { inner, .. } | Self::Distinct { inner } => {
                inner.contains_left_join()
            }
            Self::Triple(_) | Self::ExternalIndex(_) => false,
        }
    }

    pub fn lookup_used_variables<'a>(&'a self, callback: &mut impl FnMut(&'a Variable)) {
        match self {
            Self::Triple(pattern) => {
                for v in pattern.terms().filter_map(TermPattern::as_variable) {
                    callback(v);
                }
            }
            Self::Join { left, right } | Self::Union { left, right } => {
                left.lookup_used_variables(callback);
                right.lookup_used_variables(callback);
            }
            Self::LeftJoin {
                left,
                right,
                expression,
            } => {
                if let Some(expression) = expression {
                    expression.lookup_used_variables(callback);
                }
                left.lookup_used_variables(callback);
                right.lookup_used_variables(callback);
            }
            Self::Filter { inner, expression } => {
                expression.lookup_used_variables(callback);
                inner.lookup_used_variables(callback);
            }
            Self::Project { variables, .. } => {
                for v in variables {
                    callback(v);
                }
            }
            Self::Distinct { inner } => inner.lookup_used_variables(callback),
            Self::ExternalIndex(node) => {
                for v in node.variables() {
                    callback(v);
                }
            }
        }
    }

    /// Variables bound in every solution of the pattern.
    pub fn certainly_bound_variables(&self) -> FxHashSet<Variable> {
        match self {
            Self::Triple(pattern) => pattern.variables().into_iter().cloned().collect(),
            Self::Join { left, right } => {
                let mut variables = left.certainly_bound_variables();
                variables.extend(right.certainly_bound_variables());
                variables
            }
            Self::LeftJoin { left, .. } | Self::Filter { inner: left, .. } => {
                left.certainly_bound_variables()
            }
            Self::Union { left, right } => {
                let right = right.certainly_bound_variables();
                left.certainly_bound_variables()
                    .into_iter()
                    .filter(|v| right.contains(v))
                    .collect()
            }
            Self::Project { inner, variables } => inner
                .certainly_bound_variables()
                .into_iter()
                .filter(|v| variables.contains(v))
                .collect(),
            Self::Distinct { inner } => inner.certainly_bound_variables(),
            Self::ExternalIndex(node) => node.variables().iter().cloned().collect(),
        }
    }

    /// Calls `callback` on every external index node of the tree, left to right.
    pub fn lookup_external_index_nodes<'a>(
        &'a self,
        callback: &mut impl FnMut(&'a ExternalIndexNode),
    ) {
        match self {
            Self::Triple(_) => {}
            Self::Join { left, right }
            | Self::Union { left, right }
            | Self::LeftJoin { left, right, .. } => {
                left.lookup_external_index_nodes(callback);
                right.lookup_external_index_nodes(callback);
            }
            Self::Filter { inner, .. } | Self::Project { inner, .. } | Self::Distinct { inner } => {
                inner.lookup_external_index_nodes(callback)
            }
            Self::ExternalIndex(node) => callback(node),
        }
    }

    /// Number of triple patterns left in the tree.
    pub fn triple_pattern_count(&self) -> usize {
        match self {
            Self::Triple(_) => 1,
            Self::Join { left, right }
            | Self::Union { left, right }
            | Self::LeftJoin { left, right, .. } => {
                left.triple_pattern_count() + right.triple_pattern_count()
            }
            Self::Filter { inner, .. } | Self::Project { inner, .. } | Self::Distinct { inner } => {
                inner.triple_pattern_count()
            }
            Self::ExternalIndex(_) => 0,
        }
    }
}

impl From<TriplePattern> for GraphPattern {
    #[inline]
    fn from(pattern: TriplePattern) -> Self {
        Self::Triple(pattern)
    }
}

impl From<ExternalIndexNode> for GraphPattern {
    #[inline]
    fn from(node: ExternalIndexNode) -> Self {
        Self::ExternalIndex(node)
    }
}

impl fmt::Display for GraphPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Triple(pattern) => pattern.fmt(f),
            Self::Join { left, right } => write!(f, "(join {left} {right})"),
            Self::LeftJoin {
                left,
                right,
                expression,
            } => {
                if let Some(expression) = expression {
                    write!(f, "(leftjoin {left} {right} {expression})")
                } else {
                    write!(f, "(leftjoin {left} {right})")
                }
            }
            Self::Filter { expression, inner } => write!(f, "(filter {expression} {inner})"),
            Self::Union { left, right } => write!(f, "(union {left} {right})"),
            Self::Project { inner, variables } => {
                f.write_str("(project (")?;
                for (i, v) in variables.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    v.fmt(f)?;
                }
                write!(f, ") {inner})")
            }
            Self::Distinct { inner } => write!(f, "(distinct {inner})"),
            Self::ExternalIndex(node) => node.fmt(f),
        }
    }
}

/// The substitution of an [`ExternalIndex`] for some triple patterns of a query.
///
/// The node keeps the renaming from the index variables to the query terms,
/// evaluation translates bindings through it in both directions.
#[derive(Clone)]
pub struct ExternalIndexNode {
    index: Arc<dyn ExternalIndex>,
    shape_patterns: Vec<usize>,
    variables: Vec<Variable>,
    renaming: FxHashMap<Variable, TermPattern>,
    patterns: Vec<TriplePattern>,
    filters: Vec<Expression>,
}

impl ExternalIndexNode {
    pub(crate) fn new(
        index: Arc<dyn ExternalIndex>,
        shape_patterns: Vec<usize>,
        variables: Vec<Variable>,
        renaming: FxHashMap<Variable, TermPattern>,
        patterns: Vec<TriplePattern>,
        filters: Vec<Expression>,
    ) -> Self {
        Self {
            index,
            shape_patterns,
            variables,
            renaming,
            patterns,
            filters,
        }
    }

    #[inline]
    pub fn index(&self) -> &Arc<dyn ExternalIndex> {
        &self.index
    }

    /// The query variables the node binds.
    #[inline]
    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Positions in the index shape of the patterns the node replaces.
    #[inline]
    pub fn shape_patterns(&self) -> &[usize] {
        &self.shape_patterns
    }

    /// The query triple patterns the node replaces.
    #[inline]
    pub fn patterns(&self) -> &[TriplePattern] {
        &self.patterns
    }

    /// The query filters the index applies internally.
    #[inline]
    pub fn filters(&self) -> &[Expression] {
        &self.filters
    }

    /// The query term an index variable has been mapped to.
    #[inline]
    pub fn image(&self, index_variable: &Variable) -> Option<&TermPattern> {
        self.renaming.get(index_variable)
    }

    /// Estimated number of solutions, from the index.
    #[inline]
    pub fn cardinality(&self) -> usize {
        self.index.cardinality()
    }

    /// Evaluates the node for a binding of query variables.
    ///
    /// Query constants the index variables have been mapped to are given to the index as input,
    /// and each index solution is translated back to the query variables of the node.
    pub fn evaluate(&self, input: &Binding) -> Result<NodeSolutions, IndexEvaluationError> {
        let mut index_input = Binding::default();
        for (index_variable, image) in &self.renaming {
            let value = match image {
                TermPattern::Variable(v) => input.get(v).cloned(),
                constant => constant.to_term(),
            };
            if let Some(value) = value {
                index_input.insert(index_variable.clone(), value);
            }
        }
        let outputs = self
            .renaming
            .iter()
            .filter(|(index_variable, _)| self.index.binding_names().contains(index_variable))
            .map(|(index_variable, image)| (index_variable.clone(), image.clone()))
            .collect();
        Ok(NodeSolutions {
            solutions: self.index.evaluate(&index_input, &self.shape_patterns)?,
            outputs: Arc::new(outputs),
            produced: Arc::from(self.variables.as_slice()),
            input: input.clone(),
        })
    }
}

impl PartialEq for ExternalIndexNode {
    fn eq(&self, other: &Self) -> bool {
        self.index.id() == other.index.id()
            && self.shape_patterns == other.shape_patterns
            && self.variables == other.variables
            && self.patterns == other.patterns
            && self.filters == other.filters
    }
}

impl Eq for ExternalIndexNode {}

impl Hash for ExternalIndexNode {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.id().hash(state);
        self.shape_patterns.hash(state);
        self.variables.hash(state);
        self.patterns.hash(state);
        self.filters.hash(state);
    }
}

impl fmt::Debug for ExternalIndexNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalIndexNode")
            .field("index", &self.index.id())
            .field("shape_patterns", &self.shape_patterns)
            .field("variables", &self.variables)
            .field("renaming", &self.renaming)
            .field("patterns", &self.patterns)
            .field("filters", &self.filters)
            .finish()
    }
}

impl fmt::Display for ExternalIndexNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(index <{}> (", self.index.id())?;
        for (i, v) in self.variables.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            v.fmt(f)?;
        }
        f.write_str("))")
    }
}

/// The solutions of an [`ExternalIndexNode`] expressed with the query variables.
///
/// Like the index solutions it wraps, it can be iterated several times.
pub struct NodeSolutions {
    solutions: IndexSolutions,
    /// exposed index variable -> query term, for every exposed variable of the consumed patterns
    outputs: Arc<Vec<(Variable, TermPattern)>>,
    produced: Arc<[Variable]>,
    input: Binding,
}

impl NodeSolutions {
    /// Starts a new pass over the solutions.
    pub fn iter(&self) -> impl Iterator<Item = Result<Binding, IndexEvaluationError>> + 'static {
        let outputs = Arc::clone(&self.outputs);
        let produced = Arc::clone(&self.produced);
        let input = self.input.clone();
        self.solutions.iter().filter_map(move |solution| {
            let solution = match solution {
                Ok(solution) => solution,
                Err(e) => return Some(Err(e)),
            };
            let mut output = input.clone();
            for (index_variable, image) in outputs.iter() {
                // A consumed pattern without value means the index solution does not match it
                let value = solution.get(index_variable)?;
                match image {
                    TermPattern::Variable(query_variable) => {
                        if let Some(existing) = output.get(query_variable) {
                            if existing != value {
                                return None;
                            }
                        } else if produced.contains(query_variable) {
                            output.insert(query_variable.clone(), value.clone());
                        }
                    }
                    constant => {
                        if constant.to_term().as_ref() != Some(value) {
                            return None;
                        }
                    }
                }
            }
            Some(Ok(output))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn var(name: &str) -> Variable {
        Variable::new_unchecked(name)
    }

    fn iri(value: &str) -> NamedNode {
        NamedNode::new_unchecked(value)
    }

    #[test]
    fn triple_pattern_variables_are_deduplicated() {
        let pattern = TriplePattern::new(var("s"), iri("http://example.com/p"), var("s"))
            .in_graph(var("g"));
        assert_eq!(pattern.variables(), vec![&var("s"), &var("g")]);
    }

    #[test]
    fn filter_merges_nested_filters() {
        let inner = GraphPattern::Triple(TriplePattern::new(
            var("s"),
            iri("http://example.com/p"),
            var("o"),
        ));
        let pattern = GraphPattern::filter(
            GraphPattern::filter(inner.clone(), Expression::Bound(var("s"))),
            Expression::Bound(var("o")),
        );
        assert_eq!(
            pattern,
            GraphPattern::Filter {
                inner: Box::new(inner),
                expression: Expression::And(vec![
                    Expression::Bound(var("s")),
                    Expression::Bound(var("o"))
                ]),
            }
        );
    }

    #[test]
    fn left_join_only_certainly_binds_left_side() {
        let pattern = GraphPattern::left_join(
            TriplePattern::new(var("s"), iri("http://example.com/p"), var("o")).into(),
            TriplePattern::new(var("o"), iri("http://example.com/q"), var("x")).into(),
            None,
        );
        let bound = pattern.certainly_bound_variables();
        assert!(bound.contains(&var("s")));
        assert!(bound.contains(&var("o")));
        assert!(!bound.contains(&var("x")));
    }

    #[test]
    fn rename_expression() {
        let mut renaming = FxHashMap::default();
        renaming.insert(var("a"), TermPattern::Variable(var("x")));
        renaming.insert(var("b"), TermPattern::Literal(Literal::from(3)));
        let expression = Expression::greater(var("a"), var("b"));
        assert_eq!(
            expression.rename(&renaming),
            Some(Expression::greater(var("x"), Literal::from(3)))
        );
        assert_eq!(Expression::Bound(var("b")).rename(&renaming), None);
        assert_eq!(Expression::Bound(var("c")).rename(&renaming), None);
    }

    #[test]
    fn and_all_flattens_conjunctions() {
        let e = Expression::and_all([
            Expression::Bound(var("a")),
            Expression::and_all([Expression::Bound(var("b")), Expression::Bound(var("c"))]),
            true.into(),
        ]);
        assert_eq!(e.into_conjuncts().len(), 3);
    }
}
