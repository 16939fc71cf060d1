//! Planning scenarios over small social network queries.

use oxrdf::{Literal, Term};
use sparindex::algebra::{Expression, GraphPattern, NamedNode, TermPattern, TriplePattern, Variable};
use sparindex::{
    CardinalityRater, EntityIndex, EntityStorage, ExternalIndex, FilterFunctionIndex,
    IndexCatalogue, IndexPlanner, MemoryEntityStorage, MemoryFunctionStorage, MemoryPcjStorage,
    PcjDefinition, PcjIndex, PlanRater, PlanStatistics, PlanningLimits, PlanningMode,
    RewriteError, RewrittenSegment, Type,
};
use rustc_hash::FxHashSet;
use spargebra::{Query, SparqlParser};
use std::fmt::Write;
use std::sync::{Arc, Once};

static TRACING: Once = Once::new();

fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .init();
    });
}

const Q7: &str = "SELECT ?s ?t ?u { ?s a ?t . ?t <http://www.w3.org/2000/01/rdf-schema#label> ?u . ?u <uri:talksTo> ?s . }";
const Q12: &str = "SELECT ?b ?p ?dog ?cat { ?b a ?p . ?dog a ?cat. }";
const Q15: &str = "SELECT ?f ?m ?d ?e ?l ?c { ?f a ?m . ?e a ?l . ?d <uri:talksTo> ?f . ?c <uri:talksTo> ?e . ?m <http://www.w3.org/2000/01/rdf-schema#label> ?d . ?l <http://www.w3.org/2000/01/rdf-schema#label> ?c . }";
const Q19: &str = "SELECT ?f ?m ?d ?e ?l ?c { ?f <uri:talksTo> ?m . ?d <uri:talksTo> ?e . ?l <uri:talksTo> ?c . }";
const Q20: &str = "SELECT ?f ?m { ?f <uri:talksTo> ?m . }";
const Q21: &str = "SELECT ?s ?t ?u { ?s a ?t . ?t <http://www.w3.org/2000/01/rdf-schema#label> ?u . ?u <uri:talksTo> ?s . Filter(?s > 3). }";

fn sparql(query: &str) -> GraphPattern {
    let Query::Select { pattern, .. } = SparqlParser::new().parse_query(query).unwrap() else {
        panic!("{query} is not a SELECT query");
    };
    GraphPattern::try_from(&pattern).unwrap()
}

/// The pattern under the projection of a SELECT query.
fn unprojected(pattern: &GraphPattern) -> &GraphPattern {
    match pattern {
        GraphPattern::Project { inner, .. } => inner,
        pattern => pattern,
    }
}

fn var(name: &str) -> Variable {
    Variable::new_unchecked(name)
}

fn iri(value: &str) -> NamedNode {
    NamedNode::new_unchecked(value)
}

fn pcj(id: &str, query: &str, cardinality: usize) -> Arc<dyn ExternalIndex> {
    Arc::new(
        PcjIndex::new(
            PcjDefinition {
                id: id.into(),
                query: sparql(query),
                cardinality,
            },
            Arc::new(MemoryPcjStorage::new()),
        )
        .unwrap(),
    )
}

fn catalogue(indices: Vec<Arc<dyn ExternalIndex>>) -> IndexCatalogue {
    IndexCatalogue::new(indices).unwrap()
}

fn q7() -> Arc<dyn ExternalIndex> {
    pcj("q7", Q7, 10)
}

fn q12() -> Arc<dyn ExternalIndex> {
    pcj("q12", Q12, 1_000_000)
}

fn q20() -> Arc<dyn ExternalIndex> {
    pcj("q20", Q20, 10)
}

fn index_ids(plan: &GraphPattern) -> Vec<String> {
    PlanStatistics::of(plan)
        .index_nodes
        .iter()
        .map(|n| n.index().id().to_owned())
        .collect()
}

fn sorted_substitutions(plans: &[GraphPattern]) -> Vec<Vec<String>> {
    let mut substitutions = plans
        .iter()
        .map(|plan| {
            let mut ids = index_ids(plan);
            ids.sort();
            ids
        })
        .collect::<Vec<_>>();
    substitutions.sort();
    substitutions
}

/// `SELECT * { ?v0 <uri:talksTo> ?v1 . ... }` with `length` patterns.
fn talks_to_chain(length: usize) -> String {
    let mut query = "SELECT * {".to_owned();
    for i in 0..length {
        write!(query, " ?v{i} <uri:talksTo> ?v{} .", i + 1).unwrap();
    }
    query.push_str(" }");
    query
}

#[test]
fn exhaustive_plans_of_overlapping_indices() {
    init_tracing();
    let planner =
        IndexPlanner::new(catalogue(vec![q7(), q12()])).with_mode(PlanningMode::Exhaustive);
    let plans = planner.plans(&sparql(Q15)).unwrap();
    assert_eq!(plans.len(), 5);
    let plans = plans.collect::<Vec<_>>();

    let distinct = plans.iter().collect::<FxHashSet<_>>();
    assert_eq!(distinct.len(), 5, "every plan is different");
    assert_eq!(plans[0], sparql(Q15), "the unchanged query comes first");

    assert_eq!(
        sorted_substitutions(&plans),
        vec![
            Vec::<String>::new(),
            vec!["q12".to_owned()],
            vec!["q7".to_owned()],
            vec!["q7".to_owned()],
            vec!["q7".to_owned(), "q7".to_owned()],
        ]
    );

    let both = plans
        .iter()
        .map(PlanStatistics::of)
        .find(|s| s.index_nodes.len() == 2)
        .unwrap();
    assert_eq!(both.residual_triple_patterns, 0);
    let mut produced = both
        .index_nodes
        .iter()
        .flat_map(|n| n.variables().iter().map(Variable::as_str))
        .collect::<Vec<_>>();
    produced.sort_unstable();
    assert_eq!(produced, ["c", "d", "e", "f", "l", "m"]);
}

#[test]
fn plans_are_exhausted() {
    let planner =
        IndexPlanner::new(catalogue(vec![q7(), q12()])).with_mode(PlanningMode::Exhaustive);
    let mut plans = planner.plans(&sparql(Q15)).unwrap();
    for _ in 0..5 {
        assert!(plans.next_plan().is_ok());
    }
    assert!(matches!(plans.next_plan(), Err(RewriteError::Exhausted)));
    assert!(matches!(plans.next_plan(), Err(RewriteError::Exhausted)));
    assert_eq!(plans.next(), None);
}

#[test]
fn independent_single_pattern_indices() {
    let planner = IndexPlanner::new(catalogue(vec![q20()])).with_mode(PlanningMode::Exhaustive);
    let plans = planner.plans(&sparql(Q19)).unwrap().collect::<Vec<_>>();
    assert_eq!(plans.len(), 8);
    assert_eq!(
        plans
            .iter()
            .map(|p| PlanStatistics::of(p).index_nodes.len())
            .sum::<usize>(),
        12
    );
}

#[test]
fn too_many_plans() {
    let limits = PlanningLimits {
        max_plans: Some(4),
        ..PlanningLimits::default()
    };
    for mode in [PlanningMode::Exhaustive, PlanningMode::Optimal] {
        let planner = IndexPlanner::new(catalogue(vec![q20()]))
            .with_mode(mode)
            .with_limits(limits);
        assert!(
            matches!(
                planner.plans(&sparql(Q19)),
                Err(RewriteError::TooManyPlans { limit: 4 })
            ),
            "{mode:?} should be bounded"
        );
    }
}

#[test]
fn candidates_per_segment_are_bounded() {
    let planner = IndexPlanner::new(catalogue(vec![q20()]))
        .with_mode(PlanningMode::Exhaustive)
        .with_limits(PlanningLimits {
            max_candidates_per_segment: Some(2),
            ..PlanningLimits::default()
        });
    assert_eq!(planner.plans(&sparql(Q19)).unwrap().len(), 4);
}

#[test]
fn sibling_segments_of_an_optional_are_crossed() {
    let planner = IndexPlanner::new(catalogue(vec![
        pcj("P", "SELECT ?x ?y { ?x <http://example.com/p> ?y }", 10),
        pcj("R", "SELECT ?x ?y { ?x <http://example.com/r> ?y }", 10),
    ]))
    .with_mode(PlanningMode::Exhaustive);
    let query = sparql(
        "PREFIX ex: <http://example.com/>
        SELECT * { ?a ex:p ?b . ?b ex:q ?c OPTIONAL { ?c ex:r ?d . ?d ex:s ?e } }",
    );
    let plans = planner.plans(&query).unwrap().collect::<Vec<_>>();
    assert_eq!(plans.len(), 4);
    assert_eq!(
        sorted_substitutions(&plans),
        vec![
            Vec::<String>::new(),
            vec!["P".to_owned()],
            vec!["P".to_owned(), "R".to_owned()],
            vec!["R".to_owned()],
        ]
    );
    for plan in &plans {
        assert!(
            matches!(unprojected(plan), GraphPattern::LeftJoin { .. }),
            "the optional should be kept: {plan}"
        );
    }
}

#[test]
fn union_branches_are_crossed() {
    let planner = IndexPlanner::new(catalogue(vec![
        pcj("P", "SELECT ?x ?y { ?x <http://example.com/p> ?y }", 10),
        pcj("R", "SELECT ?x ?y { ?x <http://example.com/r> ?y }", 10),
    ]))
    .with_mode(PlanningMode::Exhaustive);
    let query = sparql(
        "PREFIX ex: <http://example.com/>
        SELECT * { { ?a ex:p ?b . ?b ex:q ?c } UNION { ?c ex:r ?d . ?d ex:s ?e } }",
    );
    let plans = planner.plans(&query).unwrap().collect::<Vec<_>>();
    assert_eq!(plans.len(), 4);
    assert_eq!(plans.iter().collect::<FxHashSet<_>>().len(), 4);
    assert_eq!(
        sorted_substitutions(&plans),
        vec![
            Vec::<String>::new(),
            vec!["P".to_owned()],
            vec!["P".to_owned(), "R".to_owned()],
            vec!["R".to_owned()],
        ]
    );
}

#[test]
fn greedy_uses_each_index_once() {
    init_tracing();
    let planner = IndexPlanner::new(catalogue(vec![q7(), q12()]));
    let plans = planner.plans(&sparql(Q15)).unwrap();
    assert_eq!(plans.len(), 1);
    let plan = planner.optimize(&sparql(Q15)).unwrap();
    assert_eq!(index_ids(&plan), ["q7"]);
    assert_eq!(PlanStatistics::of(&plan).residual_triple_patterns, 3);
}

#[test]
fn greedy_stops_at_the_first_match() {
    let index = pcj(
        "five",
        "SELECT * { ?a <uri:talksTo> ?b . ?c <uri:talksTo> ?d . ?e <uri:talksTo> ?f . ?g <uri:talksTo> ?h . ?i <uri:talksTo> ?j }",
        10,
    );
    let query = sparql(&talks_to_chain(30));
    let plan = IndexPlanner::new(catalogue(vec![Arc::clone(&index)]))
        .optimize(&query)
        .unwrap();
    let statistics = PlanStatistics::of(&plan);
    assert_eq!(index_ids(&plan), ["five"]);
    assert_eq!(statistics.index_nodes[0].patterns().len(), 5);
    assert_eq!(statistics.residual_triple_patterns, 25);

    let plans = IndexPlanner::new(catalogue(vec![index]))
        .with_mode(PlanningMode::Exhaustive)
        .with_limits(PlanningLimits {
            max_candidates_per_segment: Some(3),
            max_plans: Some(10),
        })
        .plans(&query)
        .unwrap();
    // the three candidates overlap
    assert_eq!(plans.len(), 4);
}

#[test]
fn optimal_prefers_the_cheapest_substitution() {
    let plan = IndexPlanner::new(catalogue(vec![q7(), q12()]))
        .with_mode(PlanningMode::Optimal)
        .with_rater(CardinalityRater)
        .optimize(&sparql(Q15))
        .unwrap();
    let statistics = PlanStatistics::of(&plan);
    assert_eq!(index_ids(&plan), ["q7", "q7"]);
    assert_eq!(statistics.residual_triple_patterns, 0);
}

struct FewestSubstitutions;

impl PlanRater for FewestSubstitutions {
    fn rate(&self, segment: &RewrittenSegment) -> usize {
        segment.candidates().len()
    }
}

#[test]
fn optimal_follows_the_rater() {
    let plan = IndexPlanner::new(catalogue(vec![q7(), q12()]))
        .with_mode(PlanningMode::Optimal)
        .with_rater(FewestSubstitutions)
        .optimize(&sparql(Q15))
        .unwrap();
    assert_eq!(plan, sparql(Q15));
}

#[test]
fn no_applicable_index_keeps_the_query() {
    let query = sparql(
        "SELECT * {
            ?s a ?t . ?t <http://www.w3.org/2000/01/rdf-schema#label> ?u . ?u <uri:talksTo> ?s .
            OPTIONAL { ?s <http://www.w3.org/2000/01/rdf-schema#label> ?n }
            FILTER(?s > 3)
        }",
    );
    for mode in [
        PlanningMode::Greedy,
        PlanningMode::Exhaustive,
        PlanningMode::Optimal,
    ] {
        let planner = IndexPlanner::new(IndexCatalogue::default()).with_mode(mode);
        assert_eq!(planner.plans(&query).unwrap().len(), 1);
        assert_eq!(planner.optimize(&query).unwrap(), query);
    }
}

#[test]
fn index_inside_optional_and_filter() {
    let plan = IndexPlanner::new(catalogue(vec![q7()]))
        .optimize(&sparql(Q21))
        .unwrap();
    let GraphPattern::Filter { expression, inner } = unprojected(&plan) else {
        panic!("the filter should stay above the index node: {plan}");
    };
    assert_eq!(*expression, Expression::greater(var("s"), 3_i64));
    assert!(matches!(inner.as_ref(), GraphPattern::ExternalIndex(_)));

    let optional = sparql(
        "SELECT * {
            ?x <http://www.w3.org/2000/01/rdf-schema#label> ?y
            OPTIONAL { ?s a ?t . ?t <http://www.w3.org/2000/01/rdf-schema#label> ?u . ?u <uri:talksTo> ?s . }
        }",
    );
    let plan = IndexPlanner::new(catalogue(vec![q7()]))
        .optimize(&optional)
        .unwrap();
    let GraphPattern::LeftJoin { left, right, .. } = unprojected(&plan) else {
        panic!("the optional should be kept: {plan}");
    };
    assert_eq!(
        **left,
        GraphPattern::Triple(TriplePattern::new(
            var("x"),
            iri("http://www.w3.org/2000/01/rdf-schema#label"),
            var("y")
        ))
    );
    assert_eq!(index_ids(right), ["q7"]);
}

#[test]
fn filters_are_moved_above_their_index_nodes() {
    let query = sparql(
        "PREFIX ex: <http://example.com/>
        SELECT * { ?x ex:p ?y . ?y ex:q ?z . ?z ex:r ?w . ?w ex:s ?v FILTER(?y > 3 && ?v < 5) }",
    );
    let planner = IndexPlanner::new(catalogue(vec![
        pcj(
            "pq",
            "PREFIX ex: <http://example.com/> SELECT * { ?a ex:p ?b . ?b ex:q ?c }",
            10,
        ),
        pcj("s", "SELECT * { ?a <http://example.com/s> ?b }", 10),
    ]));
    let plan = planner.optimize(&query).unwrap();

    let GraphPattern::Join { left, right } = unprojected(&plan) else {
        panic!("unexpected plan {plan}");
    };
    assert!(
        is_filtered_index(right, "s", &Expression::less(var("v"), 5_i64)),
        "unexpected right side {right}"
    );
    let GraphPattern::Join { left, right } = left.as_ref() else {
        panic!("unexpected left side {left}");
    };
    assert_eq!(
        **right,
        GraphPattern::Triple(TriplePattern::new(
            var("z"),
            iri("http://example.com/r"),
            var("w")
        ))
    );
    assert!(
        is_filtered_index(left, "pq", &Expression::greater(var("y"), 3_i64)),
        "unexpected left side {left}"
    );
}

fn is_filtered_index(pattern: &GraphPattern, id: &str, filter: &Expression) -> bool {
    let GraphPattern::Filter { expression, inner } = pattern else {
        return false;
    };
    let GraphPattern::ExternalIndex(node) = inner.as_ref() else {
        return false;
    };
    expression == filter && node.index().id() == id
}

#[test]
fn index_filters_must_be_in_the_query() {
    let with_filter = pcj(
        "old",
        "SELECT * { ?s a ?t . ?t <http://www.w3.org/2000/01/rdf-schema#label> ?u FILTER(?s > 3) }",
        10,
    );
    let planner = IndexPlanner::new(catalogue(vec![with_filter]));

    let unfiltered =
        sparql("SELECT * { ?a a ?b . ?b <http://www.w3.org/2000/01/rdf-schema#label> ?c }");
    assert!(index_ids(&planner.optimize(&unfiltered).unwrap()).is_empty());

    let filtered = sparql(
        "SELECT * { ?a a ?b . ?b <http://www.w3.org/2000/01/rdf-schema#label> ?c FILTER(?a > 3) }",
    );
    let plan = planner.optimize(&filtered).unwrap();
    assert!(
        matches!(unprojected(&plan), GraphPattern::ExternalIndex(node) if node.filters().len() == 1),
        "the filter should be applied by the index: {plan}"
    );
}

fn entities() -> Arc<dyn EntityStorage> {
    Arc::new(MemoryEntityStorage::new())
}

#[test]
fn entity_index_requires_its_type() {
    let person = Type::new(
        iri("http://example.com/Person"),
        [iri("http://example.com/name")],
    );
    let index: Arc<dyn ExternalIndex> =
        Arc::new(EntityIndex::new("people", person, entities()).unwrap());
    let planner = IndexPlanner::new(catalogue(vec![index]));

    let people = sparql(
        "PREFIX ex: <http://example.com/> SELECT * { ?x a ex:Person . ?x ex:name ?n }",
    );
    let plan = planner.optimize(&people).unwrap();
    assert_eq!(index_ids(&plan), ["people"]);
    assert_eq!(PlanStatistics::of(&plan).residual_triple_patterns, 0);

    let dogs =
        sparql("PREFIX ex: <http://example.com/> SELECT * { ?x a ex:Dog . ?x ex:name ?n }");
    assert_eq!(planner.optimize(&dogs).unwrap(), dogs);

    let both = sparql(
        "PREFIX ex: <http://example.com/> SELECT * { ?x a ex:Person . ?x a ex:Dog . ?x ex:name ?n }",
    );
    assert_eq!(planner.optimize(&both).unwrap(), both);
}

#[test]
fn entity_index_consumes_the_present_properties() {
    let person = Type::new(
        iri("http://example.com/Person"),
        [
            iri("http://example.com/name"),
            iri("http://example.com/age"),
            iri("http://example.com/email"),
        ],
    );
    let index: Arc<dyn ExternalIndex> =
        Arc::new(EntityIndex::new("people", person, entities()).unwrap());
    let query = sparql(
        "PREFIX ex: <http://example.com/>
        SELECT * { ?x ex:age ?a . ?x a ex:Person . ?x ex:knows ?y }",
    );
    let plan = IndexPlanner::new(catalogue(vec![index]))
        .optimize(&query)
        .unwrap();
    let statistics = PlanStatistics::of(&plan);
    assert_eq!(statistics.index_nodes.len(), 1);
    assert_eq!(statistics.residual_triple_patterns, 1);
    let node = &statistics.index_nodes[0];
    // the type pattern and the age pattern
    assert_eq!(node.shape_patterns(), [0, 2]);
    assert_eq!(node.patterns().len(), 2);
    assert_eq!(node.variables(), [var("x"), var("a")]);
}

fn starts_with(args: &[Term]) -> Option<Term> {
    let [Term::Literal(value), Term::Literal(prefix)] = args else {
        return None;
    };
    Some(Literal::from(value.value().starts_with(prefix.value())).into())
}

#[test]
fn filter_function_index_takes_the_filter_constants() {
    let storage = MemoryFunctionStorage::new()
        .with_function(iri("http://example.com/startsWith"), starts_with);
    let index: Arc<dyn ExternalIndex> = Arc::new(
        FilterFunctionIndex::new(
            "names",
            iri("http://example.com/name"),
            iri("http://example.com/startsWith"),
            2,
            Arc::new(storage),
        )
        .unwrap(),
    );
    let planner = IndexPlanner::new(catalogue(vec![index]));

    let query = sparql(
        "PREFIX ex: <http://example.com/>
        SELECT ?s { ?s ex:name ?n . ?s ex:age ?a FILTER(ex:startsWith(?n, \"Al\")) }",
    );
    let plan = planner.optimize(&query).unwrap();
    let statistics = PlanStatistics::of(&plan);
    assert_eq!(index_ids(&plan), ["names"]);
    assert_eq!(statistics.residual_triple_patterns, 1);
    let node = &statistics.index_nodes[0];
    assert_eq!(node.filters().len(), 1);
    assert_eq!(
        node.image(&var("argument1")),
        Some(&TermPattern::Literal(Literal::new_simple_literal("Al")))
    );
    assert_eq!(node.variables(), [var("s")]);

    let variable_argument = sparql(
        "PREFIX ex: <http://example.com/>
        SELECT ?s { ?s ex:name ?n . ?s ex:nick ?k FILTER(ex:startsWith(?n, ?k)) }",
    );
    assert!(index_ids(&planner.optimize(&variable_argument).unwrap()).is_empty());

    let unfiltered =
        sparql("PREFIX ex: <http://example.com/> SELECT ?s { ?s ex:name ?n . ?s ex:age ?a }");
    assert!(index_ids(&planner.optimize(&unfiltered).unwrap()).is_empty());
}

#[test]
fn invalid_index_is_rejected() {
    let result = PcjIndex::new(
        PcjDefinition {
            id: "optional".into(),
            query: sparql(
                "SELECT * { ?s a ?t OPTIONAL { ?t <http://www.w3.org/2000/01/rdf-schema#label> ?u } }",
            ),
            cardinality: 1,
        },
        Arc::new(MemoryPcjStorage::new()),
    );
    assert!(matches!(
        result,
        Err(RewriteError::InvalidIndexShape { index, .. }) if index == "optional"
    ));
}

#[test]
fn unsupported_query_is_reported() {
    let Query::Select { pattern, .. } = SparqlParser::new()
        .parse_query("SELECT ?s { ?s <uri:talksTo>+ ?o }")
        .unwrap()
    else {
        panic!("not a SELECT query");
    };
    assert!(matches!(
        GraphPattern::try_from(&pattern),
        Err(RewriteError::UnsupportedPattern(_))
    ));
}
