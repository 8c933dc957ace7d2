//! Execution of Workflow Description Language (WDL) workflows on a managed
//! batch compute service.
//!
//! A workflow invocation is submitted as a single remote job (see
//! [`submit`]); inside that job the engine runs (see [`run`]) and every task
//! it schedules is executed as its own remote job through the
//! [`BatchBackend`](backend::BatchBackend), which is served to the engine
//! over a local socket (see [`service`]). Task jobs share a network
//! filesystem, on which each task attempt gets a private scratch directory
//! (see [`scratch`]).
//!
//! The remote scheduler is abstracted by [`BatchScheduler`]; an
//! implementation for AWS Batch is provided by [`AwsBatchScheduler`].

pub mod aws;
pub mod backend;
pub mod config;
pub mod driver;
pub mod job;
pub mod logs;
pub mod run;
pub mod scheduler;
pub mod scratch;
pub mod service;
pub mod stage;
pub mod submit;

pub use backend::BatchBackend;
pub use backend::TaskExecutionBackend;
pub use config::BatchConfig;
pub use driver::DriverError;
pub use driver::JobDriver;
pub use job::JobHandle;
pub use job::JobSpec;
pub use job::JobState;
pub use job::JobStatus;
pub use scheduler::AwsBatchScheduler;
pub use scheduler::BatchScheduler;
pub use scheduler::SchedulerError;
