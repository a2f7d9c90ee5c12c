//! `sluice-worker`: process wiring for the job queue and ranking pipeline.

pub mod app;
pub mod config;
