//! Control nodes
//!
//! Nodes that choose branches or repeat work.

mod condition;
mod loop_node;
mod switch;

pub use condition::ConditionPlugin;
pub use loop_node::LoopPlugin;
pub use switch::SwitchPlugin;
