//! Context-carrying logger handed to nodes
//!
//! `NodeLogger` is a thin layer over the `log` facade: every record is
//! emitted under a fixed target and prefixed with the logger's context
//! fields, so a host's `env_logger` (or any other `log` backend) can filter
//! and correlate node output without the engine owning a logging stack.

use log::Level;

/// Default log target for node output
pub const NODE_TARGET: &str = "node_engine::node";

/// Leveled logger with attached context
#[derive(Debug, Clone)]
pub struct NodeLogger {
    target: &'static str,
    fields: Vec<(String, String)>,
}

impl NodeLogger {
    /// Create a logger with no context
    pub fn new() -> Self {
        Self {
            target: NODE_TARGET,
            fields: Vec::new(),
        }
    }

    /// Create a logger with a custom target
    pub fn with_target(target: &'static str) -> Self {
        Self {
            target,
            fields: Vec::new(),
        }
    }

    /// Derive a logger with one more context field
    pub fn child(&self, key: impl Into<String>, value: impl ToString) -> Self {
        let mut fields = self.fields.clone();
        fields.push((key.into(), value.to_string()));
        Self {
            target: self.target,
            fields,
        }
    }

    /// Rendered context prefix, e.g. `flow=f1 node=n2`
    pub fn context(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn log(&self, level: Level, message: &str) {
        if !log::log_enabled!(target: self.target, level) {
            return;
        }
        if self.fields.is_empty() {
            log::log!(target: self.target, level, "{}", message);
        } else {
            log::log!(target: self.target, level, "[{}] {}", self.context(), message);
        }
    }

    pub fn trace(&self, message: &str) {
        self.log(Level::Trace, message);
    }

    pub fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

impl Default for NodeLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_accumulates_context() {
        let logger = NodeLogger::new().child("flow", "f1");
        let child = logger.child("node", "n2");

        assert_eq!(logger.context(), "flow=f1");
        assert_eq!(child.context(), "flow=f1 node=n2");
    }

    #[test]
    fn test_logging_does_not_panic_without_backend() {
        let _ = env_logger::builder().is_test(true).try_init();
        let logger = NodeLogger::with_target("test").child("k", 1);
        logger.info("hello");
        logger.error("boom");
    }
}
