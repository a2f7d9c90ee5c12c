//! Infrastructure layer: job storage, worker runtime and the ranking pipeline.

pub mod jobs;
pub mod ranking;
pub mod schema;
