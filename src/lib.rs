//! Job execution and dry-run simulation engine.
//!
//! A [`Job`](model::Job) is a trigger plus an ordered list of tasks, each an
//! action pipeline over JSON data items. The [`engine`] runs jobs on a
//! bounded worker pool and keeps their execution history; the
//! [`simulation`] module runs the same pipelines with every connector call
//! that is not marked safe intercepted.

pub mod action;
pub mod cli;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod model;
pub mod registry;
pub mod simulation;
pub mod store;
pub mod trigger;
pub mod ui;

pub use error::{ActionError, EngineError};
