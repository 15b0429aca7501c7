//! Integration nodes
//!
//! Nodes that talk to external services over HTTP.

mod http_request;
mod llm_call;

pub use http_request::HttpRequestPlugin;
pub use llm_call::LlmCallPlugin;
