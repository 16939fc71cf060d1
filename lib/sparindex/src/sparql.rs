//! Conversion of [`spargebra`] query trees into the trees the planner rewrites.
//!
//! ```
//! use sparindex::algebra::GraphPattern;
//! use spargebra::{Query, SparqlParser};
//!
//! let Query::Select { pattern, .. } = SparqlParser::new()
//!     .parse_query("SELECT ?s WHERE { ?s a ?t . FILTER(BOUND(?t)) }")?
//! else {
//!     unreachable!()
//! };
//! let pattern = GraphPattern::try_from(&pattern)?;
//! assert_eq!(pattern.triple_pattern_count(), 1);
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

use crate::algebra::{Expression, GraphPattern, TermPattern, TriplePattern};
use crate::error::RewriteError;
use oxrdf::{BlankNode, Variable};
use spargebra::algebra::{Expression as SparqlExpression, Function, GraphPattern as SparqlPattern};
use spargebra::term::{
    NamedNodePattern, TermPattern as SparqlTermPattern, TriplePattern as SparqlTriplePattern,
};

impl TryFrom<&SparqlPattern> for GraphPattern {
    type Error = RewriteError;

    /// Supports basic graph patterns, `GRAPH`, joins, `OPTIONAL`, `FILTER`, `UNION`, projections,
    /// `DISTINCT` and `REDUCED`.
    ///
    /// Blank nodes become variables, they are scoped to the query.
    fn try_from(pattern: &SparqlPattern) -> Result<Self, Self::Error> {
        convert_pattern(pattern, None)
    }
}

fn convert_pattern(
    pattern: &SparqlPattern,
    graph_name: Option<&TermPattern>,
) -> Result<GraphPattern, RewriteError> {
    Ok(match pattern {
        SparqlPattern::Bgp { patterns } => GraphPattern::join_all(
            patterns
                .iter()
                .map(|pattern| Ok(GraphPattern::Triple(convert_triple(pattern, graph_name)?)))
                .collect::<Result<Vec<_>, RewriteError>>()?,
        )
        .ok_or_else(|| RewriteError::UnsupportedPattern("The empty basic graph pattern".into()))?,
        SparqlPattern::Join { left, right } => GraphPattern::join(
            convert_pattern(left, graph_name)?,
            convert_pattern(right, graph_name)?,
        ),
        SparqlPattern::LeftJoin {
            left,
            right,
            expression,
        } => GraphPattern::left_join(
            convert_pattern(left, graph_name)?,
            convert_pattern(right, graph_name)?,
            expression.as_ref().map(convert_expression).transpose()?,
        ),
        SparqlPattern::Filter { expr, inner } => GraphPattern::filter(
            convert_pattern(inner, graph_name)?,
            convert_expression(expr)?,
        ),
        SparqlPattern::Union { left, right } => GraphPattern::union(
            convert_pattern(left, graph_name)?,
            convert_pattern(right, graph_name)?,
        ),
        SparqlPattern::Graph { name, inner } => {
            let name = match name {
                NamedNodePattern::NamedNode(node) => TermPattern::NamedNode(node.clone()),
                NamedNodePattern::Variable(variable) => TermPattern::Variable(variable.clone()),
            };
            convert_pattern(inner, Some(&name))?
        }
        SparqlPattern::Project { inner, variables } => {
            GraphPattern::project(convert_pattern(inner, graph_name)?, variables.clone())
        }
        SparqlPattern::Distinct { inner } | SparqlPattern::Reduced { inner } => {
            GraphPattern::distinct(convert_pattern(inner, graph_name)?)
        }
        pattern => return Err(RewriteError::UnsupportedPattern(pattern.to_string())),
    })
}

fn convert_triple(
    pattern: &SparqlTriplePattern,
    graph_name: Option<&TermPattern>,
) -> Result<TriplePattern, RewriteError> {
    let predicate = match &pattern.predicate {
        NamedNodePattern::NamedNode(node) => TermPattern::NamedNode(node.clone()),
        NamedNodePattern::Variable(variable) => TermPattern::Variable(variable.clone()),
    };
    let triple = TriplePattern::new(
        convert_term(&pattern.subject)?,
        predicate,
        convert_term(&pattern.object)?,
    );
    Ok(match graph_name {
        Some(graph_name) => triple.in_graph(graph_name.clone()),
        None => triple,
    })
}

fn convert_term(term: &SparqlTermPattern) -> Result<TermPattern, RewriteError> {
    Ok(match term {
        SparqlTermPattern::NamedNode(node) => TermPattern::NamedNode(node.clone()),
        SparqlTermPattern::BlankNode(node) => TermPattern::Variable(blank_node_variable(node)),
        SparqlTermPattern::Literal(literal) => TermPattern::Literal(literal.clone()),
        #[cfg(feature = "sparql-12")]
        SparqlTermPattern::Triple(triple) => {
            return Err(RewriteError::UnsupportedPattern(format!(
                "The quoted triple {triple}"
            )));
        }
        SparqlTermPattern::Variable(variable) => TermPattern::Variable(variable.clone()),
    })
}

/// The variable standing for a blank node.
///
/// The prefix can't be produced by the SPARQL syntax for variables.
fn blank_node_variable(node: &BlankNode) -> Variable {
    Variable::new_unchecked(format!("bnode-{}", node.as_str()))
}

fn convert_expression(expression: &SparqlExpression) -> Result<Expression, RewriteError> {
    Ok(match expression {
        SparqlExpression::NamedNode(node) => Expression::NamedNode(node.clone()),
        SparqlExpression::Literal(literal) => Expression::Literal(literal.clone()),
        SparqlExpression::Variable(variable) => Expression::Variable(variable.clone()),
        SparqlExpression::Or(left, right) => {
            Expression::or_all([convert_expression(left)?, convert_expression(right)?])
        }
        SparqlExpression::And(left, right) => {
            Expression::and_all([convert_expression(left)?, convert_expression(right)?])
        }
        SparqlExpression::Equal(left, right) => {
            Expression::equal(convert_expression(left)?, convert_expression(right)?)
        }
        SparqlExpression::SameTerm(left, right) => {
            Expression::same_term(convert_expression(left)?, convert_expression(right)?)
        }
        SparqlExpression::Greater(left, right) => {
            Expression::greater(convert_expression(left)?, convert_expression(right)?)
        }
        SparqlExpression::GreaterOrEqual(left, right) => {
            Expression::greater_or_equal(convert_expression(left)?, convert_expression(right)?)
        }
        SparqlExpression::Less(left, right) => {
            Expression::less(convert_expression(left)?, convert_expression(right)?)
        }
        SparqlExpression::LessOrEqual(left, right) => {
            Expression::less_or_equal(convert_expression(left)?, convert_expression(right)?)
        }
        SparqlExpression::Add(left, right) => Expression::Add(
            Box::new(convert_expression(left)?),
            Box::new(convert_expression(right)?),
        ),
        SparqlExpression::Subtract(left, right) => Expression::Subtract(
            Box::new(convert_expression(left)?),
            Box::new(convert_expression(right)?),
        ),
        SparqlExpression::Multiply(left, right) => Expression::Multiply(
            Box::new(convert_expression(left)?),
            Box::new(convert_expression(right)?),
        ),
        SparqlExpression::Divide(left, right) => Expression::Divide(
            Box::new(convert_expression(left)?),
            Box::new(convert_expression(right)?),
        ),
        SparqlExpression::Not(inner) => Expression::Not(Box::new(convert_expression(inner)?)),
        SparqlExpression::Bound(variable) => Expression::Bound(variable.clone()),
        SparqlExpression::FunctionCall(Function::Custom(name), args) => Expression::call(
            name.clone(),
            args.iter()
                .map(convert_expression)
                .collect::<Result<_, _>>()?,
        ),
        expression => return Err(RewriteError::UnsupportedPattern(expression.to_string())),
    })
}
