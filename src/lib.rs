//! reqforge: an asynchronous code-generation job pipeline.
//!
//! A trigger creates a job, the [`codegen::WorkerPool`] admits it, and a
//! [`codegen::JobExecutor`] drives it through clone, tool run, commit and
//! push while publishing progress through the [`hub::EventHub`].

pub mod codegen;
pub mod config;
pub mod errors;
pub mod gitops;
pub mod hub;
pub mod logging;
pub mod server;
pub mod store;
pub mod stream;
