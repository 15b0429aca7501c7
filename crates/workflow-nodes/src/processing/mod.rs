//! Processing nodes
//!
//! Nodes that reshape data without side effects.

mod transform;

pub use transform::{TransformPlugin, TransformType};
