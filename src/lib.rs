//! The sprocket-batch command line tool.
//!
//! The tool submits Workflow Description Language (WDL) workflows to AWS
//! Batch and runs them there, executing each task as its own Batch job.

pub mod commands;
pub mod config;
