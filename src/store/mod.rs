//! SQLite persistence for jobs, requirement status and event streams.

pub mod db;

pub use db::{DbHandle, EventRow, JobDb};
