//! [GeoSPARQL](https://opengeospatial.github.io/ogc-geosparql/) simple features functions for
//! [`MemoryFunctionStorage`].
//!
//! ```
//! use sparindex::geosparql::{SF_WITHIN, WKT_LITERAL, register_geosparql_functions};
//! use sparindex::{FilterFunctionIndex, FunctionStorage, MemoryFunctionStorage};
//! use oxrdf::{Literal, NamedNode, Term};
//! use std::sync::Arc;
//!
//! let location = NamedNode::new("http://example.com/location")?;
//! let storage = register_geosparql_functions(MemoryFunctionStorage::new());
//! storage.insert(
//!     NamedNode::new("http://example.com/paris")?,
//!     location.clone(),
//!     Literal::new_typed_literal("POINT(2.35 48.85)", WKT_LITERAL),
//! );
//! let france = Term::from(Literal::new_typed_literal(
//!     "POLYGON((-5 42, 8 42, 8 51, -5 51, -5 42))",
//!     WKT_LITERAL,
//! ));
//! assert_eq!(storage.search(&location, &SF_WITHIN.into_owned(), &[france])?.len(), 1);
//!
//! let index = FilterFunctionIndex::new("within", location, SF_WITHIN.into(), 2, Arc::new(storage))?;
//! assert_eq!(index.function().as_str(), SF_WITHIN.as_str());
//! # Result::<_, Box<dyn std::error::Error>>::Ok(())
//! ```

use crate::index::MemoryFunctionStorage;
use geo::{Contains, Geometry, Within};
use oxrdf::{Literal, NamedNodeRef, Term};
use wkt::TryFromWkt;

pub const WKT_LITERAL: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://www.opengis.net/ont/geosparql#wktLiteral");
pub const SF_EQUALS: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/sfEquals");
pub const SF_CONTAINS: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/sfContains");
pub const SF_WITHIN: NamedNodeRef<'_> =
    NamedNodeRef::new_unchecked("http://www.opengis.net/def/function/geosparql/sfWithin");

/// The functions registered by [`register_geosparql_functions`].
pub const GEOSPARQL_FUNCTIONS: [NamedNodeRef<'static>; 3] = [SF_EQUALS, SF_CONTAINS, SF_WITHIN];

/// Registers the GeoSPARQL functions on WKT literals in the storage.
#[must_use]
pub fn register_geosparql_functions(storage: MemoryFunctionStorage) -> MemoryFunctionStorage {
    storage
        .with_function(SF_EQUALS.into(), sf_equals)
        .with_function(SF_CONTAINS.into(), sf_contains)
        .with_function(SF_WITHIN.into(), sf_within)
}

fn sf_equals(args: &[Term]) -> Option<Term> {
    binary_boolean_geo_fn(args, |a, b| a == b)
}

fn sf_contains(args: &[Term]) -> Option<Term> {
    binary_boolean_geo_fn(args, |a, b| a.contains(&b))
}

fn sf_within(args: &[Term]) -> Option<Term> {
    binary_boolean_geo_fn(args, |a, b| a.is_within(&b))
}

fn binary_boolean_geo_fn(
    args: &[Term],
    operation: impl FnOnce(Geometry, Geometry) -> bool,
) -> Option<Term> {
    let [left, right] = args else {
        return None;
    };
    Some(Literal::from(operation(extract_argument(left)?, extract_argument(right)?)).into())
}

fn extract_argument(term: &Term) -> Option<Geometry> {
    let Term::Literal(literal) = term else {
        return None;
    };
    if literal.datatype() != WKT_LITERAL {
        return None;
    }
    parse_wkt_literal(literal.value())
}

// Only the CRS84 reference system is supported
fn parse_wkt_literal(value: &str) -> Option<Geometry> {
    let mut value = value.trim();
    if let Some(rest) = value.strip_prefix('<') {
        let (system, rest) = rest.split_once('>')?;
        if system != "http://www.opengis.net/def/crs/OGC/1.3/CRS84" {
            return None;
        }
        value = rest.trim_start();
    }
    Geometry::try_from_wkt_str(value).ok()
}
