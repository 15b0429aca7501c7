//! Workflow Nodes
//!
//! Built-in node plugins for the node engine. Every plugin registers itself
//! at link time, so `FlowEngine::builder().with_builtins()` (or
//! `FlowEngine::register_builtins`) picks up all of them.
//!
//! # Categories
//!
//! - **Trigger**: Entry points (`manual-trigger`)
//! - **Control**: Branching and iteration (`condition`, `switch`, `loop`)
//! - **Processing**: Data shaping (`transform`)
//! - **Integration**: External services (`http-request`, `llm-call`)

mod common;
pub mod control;
pub mod integration;
pub mod processing;
pub mod trigger;

// Re-export all plugins for convenience
pub use control::*;
pub use integration::*;
pub use processing::*;
pub use trigger::*;
