//! Trigger nodes
//!
//! Entry points that start a flow.

mod manual_trigger;

pub use manual_trigger::ManualTriggerPlugin;
