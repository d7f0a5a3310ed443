//! Multi-instance integration tests

pub mod coordination_test;
pub mod fixtures;
pub mod pipeline_test;
