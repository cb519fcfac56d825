//! Shared test utilities for retitle integration tests.
//!
//! This module provides:
//! - In-memory fakes for the document system and the title evaluator
//! - `TestHarness` wiring them into an engine over an in-memory database
//! - Builders for documents, verdicts and settings

pub mod builders;
pub mod fakes;
pub mod harness;

pub use builders::*;
pub use fakes::{Call, FakeDocuments, ScriptedEvaluator};
pub use harness::TestHarness;
