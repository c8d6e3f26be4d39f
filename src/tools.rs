//! Tool dispatch (spec §6, §9 "dynamic dispatch of tools"). Tools are
//! described by data and bound by name; the host routes `HandleBridgeCall`
//! by looking up `method` in this table, no runtime reflection required.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ToolError {
    pub message: String,
}

impl ToolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// External collaborator (spec §6): `Tool.handle(args[]) -> value | ToolError`.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn parameter_names(&self) -> &[String];
    fn parameters_json_schema(&self) -> &Value;
    fn returns_json_schema(&self) -> &Value;
    fn timeout(&self) -> Duration;
    async fn handle(&self, args: Vec<Value>) -> std::result::Result<Value, ToolError>;
}

/// Name → tool lookup table, built once per completion from the tools
/// supplied at the API boundary and injected into each call's sandbox at
/// `Init` (spec §4.2).
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}
