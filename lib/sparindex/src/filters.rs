use crate::algebra::{Expression, GraphPattern};
use oxrdf::Variable;
use rustc_hash::FxHashSet;

/// Joins `nodes` from left to right and attaches each filter at the lowest position where
/// all its variables are certainly bound.
///
/// A filter goes directly above the first node binding all its variables, else directly above
/// the first join doing so, else at the top of the tree.
/// Returns `None` if there is no node.
pub fn relocate_filters(
    filters: impl IntoIterator<Item = Expression>,
    nodes: Vec<GraphPattern>,
) -> Option<GraphPattern> {
    let node_bound = nodes
        .iter()
        .map(GraphPattern::certainly_bound_variables)
        .collect::<Vec<_>>();
    let mut join_bound = Vec::with_capacity(nodes.len());
    let mut bound = FxHashSet::<Variable>::default();
    for variables in &node_bound {
        bound.extend(variables.iter().cloned());
        join_bound.push(bound.clone());
    }

    let mut node_filters = vec![Vec::new(); nodes.len()];
    let mut join_filters = vec![Vec::new(); nodes.len()];
    let mut top_filters = Vec::new();
    for filter in filters {
        let variables = filter.used_variables();
        if let Some(i) = node_bound
            .iter()
            .position(|b| variables.iter().all(|v| b.contains(*v)))
        {
            node_filters[i].push(filter);
        } else if let Some(i) = join_bound
            .iter()
            .position(|b| variables.iter().all(|v| b.contains(*v)))
        {
            join_filters[i].push(filter);
        } else {
            top_filters.push(filter);
        }
    }

    let mut tree: Option<GraphPattern> = None;
    for ((node, node_filters), join_filters) in nodes.into_iter().zip(node_filters).zip(join_filters)
    {
        let node = with_filters(node, node_filters);
        let joined = match tree {
            Some(left) => GraphPattern::join(left, node),
            None => node,
        };
        tree = Some(with_filters(joined, join_filters));
    }
    Some(with_filters(tree?, top_filters))
}

fn with_filters(pattern: GraphPattern, filters: Vec<Expression>) -> GraphPattern {
    if filters.is_empty() {
        pattern
    } else {
        GraphPattern::filter(pattern, Expression::and_all(filters))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{NamedNode, TriplePattern};

    fn var(name: &str) -> Variable {
        Variable::new_unchecked(name)
    }

    fn triple(s: &str, p: &str, o: &str) -> GraphPattern {
        TriplePattern::new(
            var(s),
            NamedNode::new_unchecked(format!("http://example.com/{p}")),
            var(o),
        )
        .into()
    }

    #[test]
    fn no_node() {
        assert_eq!(
            relocate_filters([Expression::Bound(var("a"))], Vec::new()),
            None
        );
    }

    #[test]
    fn pushed_above_single_node() {
        let tree = relocate_filters(
            [
                Expression::Bound(var("c")),
                Expression::equal(var("a"), var("c")),
                Expression::Bound(var("z")),
            ],
            vec![triple("a", "p", "b"), triple("b", "q", "c")],
        );
        assert_eq!(
            tree,
            Some(GraphPattern::filter(
                GraphPattern::filter(
                    GraphPattern::join(
                        triple("a", "p", "b"),
                        GraphPattern::filter(triple("b", "q", "c"), Expression::Bound(var("c")))
                    ),
                    Expression::equal(var("a"), var("c"))
                ),
                Expression::Bound(var("z"))
            ))
        );
    }

    #[test]
    fn optional_side_is_not_certain() {
        let optional = GraphPattern::left_join(triple("a", "p", "b"), triple("b", "q", "c"), None);
        let tree = relocate_filters(
            [Expression::Bound(var("c"))],
            vec![optional.clone(), triple("c", "r", "d")],
        );
        assert_eq!(
            tree,
            Some(GraphPattern::join(
                optional,
                GraphPattern::filter(triple("c", "r", "d"), Expression::Bound(var("c")))
            ))
        );
    }
}
