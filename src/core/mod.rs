//! Core weaving logic — registry, aggregation, ordering, planning, execution.

pub mod aggregate;
pub mod diagnostics;
pub mod eligibility;
pub mod error;
pub mod executor;
pub mod parser;
pub mod planner;
pub mod registry;
pub mod resolver;
pub mod state;
pub mod types;
