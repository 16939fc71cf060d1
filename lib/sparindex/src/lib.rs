#![doc = include_str!("../README.md")]
#![doc(test(attr(deny(warnings))))]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod algebra;
mod combinations;
mod error;
mod filters;
#[cfg(feature = "geosparql")]
pub mod geosparql;
mod index;
mod matcher;
mod planner;
mod rating;
mod segment;
mod sparql;

pub use crate::combinations::{Combinations, RewrittenItem, RewrittenSegment, greedy_combination};
pub use crate::error::{IndexEvaluationError, RewriteError};
pub use crate::filters::relocate_filters;
pub use crate::index::{
    Binding, CustomFunction, Entity, EntityIndex, EntityStorage, ExternalIndex,
    FilterFunctionIndex, FunctionStorage, IndexCatalogue, IndexShape, IndexSolutions,
    MemoryEntityStorage, MemoryFunctionStorage, MemoryPcjStorage, PcjDefinition, PcjIndex,
    PcjStorage, ShapeOrder, ShapePattern, Type,
};
pub use crate::matcher::{Candidate, VariableUsage, match_all, match_index};
pub use crate::planner::{
    IndexPlanner, PlanStatistics, PlanningLimits, PlanningMode, RewrittenPlans,
};
pub use crate::rating::{CardinalityRater, PlanRater, select_best};
pub use crate::segment::{QuerySegment, SegmentItem, SegmentKind};
