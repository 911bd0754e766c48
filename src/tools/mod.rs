//! Tool registry
//!
//! Tools are registered once at startup through [`ToolRegistryBuilder`]. The
//! built [`ToolRegistry`] is immutable and shared by every session.

pub mod movies;
pub mod schema;

use futures::future::{BoxFuture, FutureExt};
use rmcp::model::{CallToolResult, Tool};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::storage::StorageError;

pub use schema::{CompiledSchema, InputSchema, ParamKind, ParamSpec};

/// Type-erased handler: decodes validated arguments and starts the call
pub type ToolHandler = Arc<
    dyn Fn(Value) -> Result<BoxFuture<'static, Result<CallToolResult, StorageError>>, serde_json::Error>
        + Send
        + Sync,
>;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool `{0}` is already registered")]
    DuplicateTool(String),
    #[error("tool `{tool}` has an invalid input schema: {reason}")]
    InvalidSchema { tool: String, reason: String },
    #[error("unknown tool `{0}`")]
    UnknownTool(String),
    #[error("invalid argument `{field}`: expected {expected}")]
    Validation { field: String, expected: String },
    #[error("tool `{tool}` failed")]
    Execution {
        tool: String,
        #[source]
        source: StorageError,
    },
}

#[derive(Clone)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: InputSchema,
    handler: ToolHandler,
}

impl ToolDescriptor {
    /// Describe a tool whose arguments decode into `A`
    pub fn new<A, F, Fut>(
        name: &'static str,
        description: &'static str,
        input_schema: InputSchema,
        handler: F,
    ) -> Self
    where
        A: DeserializeOwned + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<CallToolResult, StorageError>> + Send + 'static,
    {
        Self {
            name,
            description,
            input_schema,
            handler: Arc::new(move |args: Value| {
                let args = serde_json::from_value::<A>(args)?;
                Ok(handler(args).boxed())
            }),
        }
    }

    /// Protocol-level description used by `tools/list`
    pub fn as_tool(&self) -> Tool {
        Tool::new(
            self.name,
            self.description,
            Arc::new(self.input_schema.to_json_schema()),
        )
    }
}

impl std::fmt::Debug for ToolDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDescriptor")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct RegisteredTool {
    descriptor: ToolDescriptor,
    schema: CompiledSchema,
}

#[derive(Debug, Default)]
pub struct ToolRegistryBuilder {
    tools: Vec<RegisteredTool>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool, compiling its input schema once
    pub fn register(&mut self, descriptor: ToolDescriptor) -> Result<&mut Self, ToolError> {
        if self.tools.iter().any(|t| t.descriptor.name == descriptor.name) {
            return Err(ToolError::DuplicateTool(descriptor.name.to_string()));
        }
        let schema = descriptor
            .input_schema
            .compile()
            .map_err(|reason| ToolError::InvalidSchema {
                tool: descriptor.name.to_string(),
                reason,
            })?;
        tracing::debug!("Registered tool {}", descriptor.name);
        self.tools.push(RegisteredTool { descriptor, schema });
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        let index = self
            .tools
            .iter()
            .enumerate()
            .map(|(i, tool)| (tool.descriptor.name, i))
            .collect();
        ToolRegistry {
            tools: self.tools,
            index,
        }
    }
}

/// Read-only set of invocable tools
#[derive(Debug)]
pub struct ToolRegistry {
    tools: Vec<RegisteredTool>,
    index: HashMap<&'static str, usize>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    fn entry(&self, name: &str) -> Option<&RegisteredTool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.entry(name).map(|tool| &tool.descriptor)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tools in registration order
    pub fn list(&self) -> Vec<Tool> {
        self.tools.iter().map(|tool| tool.descriptor.as_tool()).collect()
    }

    /// Validate `raw` against the tool's schema and run its handler.
    ///
    /// The handler is never called when validation fails.
    pub async fn invoke(&self, name: &str, raw: Option<&Value>) -> Result<CallToolResult, ToolError> {
        let tool = self
            .entry(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        let args = tool.schema.validate(raw)?;
        let call = (tool.descriptor.handler)(args).map_err(|e| ToolError::Validation {
            field: "arguments".to_string(),
            expected: e.to_string(),
        })?;
        call.await.map_err(|source| ToolError::Execution {
            tool: name.to_string(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmcp::model::Content;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Deserialize)]
    struct EchoArgs {
        message: String,
    }

    fn echo() -> ToolDescriptor {
        ToolDescriptor::new(
            "echo",
            "Echo the message",
            InputSchema::new(vec![ParamSpec::required("message", ParamKind::String, "Text")]),
            |args: EchoArgs| async move { Ok(CallToolResult::success(vec![Content::text(args.message)])) },
        )
    }

    fn text(result: &CallToolResult) -> String {
        let value = serde_json::to_value(result).unwrap();
        value["content"][0]["text"].as_str().unwrap().to_string()
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut builder = ToolRegistry::builder();
        builder.register(echo()).unwrap();
        let err = builder.register(echo()).unwrap_err();
        assert!(matches!(err, ToolError::DuplicateTool(name) if name == "echo"));
    }

    #[tokio::test]
    async fn invoke_runs_handler() {
        let mut builder = ToolRegistry::builder();
        builder.register(echo()).unwrap();
        let registry = builder.build();

        let result = registry
            .invoke("echo", Some(&json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(text(&result), "hi");
    }

    #[tokio::test]
    async fn unknown_tool_rejected() {
        let registry = ToolRegistry::builder().build();
        let err = registry.invoke("nope", None).await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "nope"));
    }

    #[tokio::test]
    async fn validation_failure_skips_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut builder = ToolRegistry::builder();
        builder
            .register(ToolDescriptor::new(
                "count",
                "Count calls",
                InputSchema::new(vec![ParamSpec::required("n", ParamKind::Integer, "n")]),
                move |_args: Value| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(CallToolResult::success(vec![]))
                    }
                },
            ))
            .unwrap();
        let registry = builder.build();

        let err = registry
            .invoke("count", Some(&json!({"n": "one"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Validation { ref field, .. } if field == "n"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_failure_wrapped_as_execution_error() {
        let mut builder = ToolRegistry::builder();
        builder
            .register(ToolDescriptor::new(
                "broken",
                "Always fails",
                InputSchema::empty(),
                |_args: Value| async { Err(StorageError::Backend("disk on fire".into())) },
            ))
            .unwrap();
        let registry = builder.build();

        let err = registry.invoke("broken", None).await.unwrap_err();
        match err {
            ToolError::Execution { tool, source } => {
                assert_eq!(tool, "broken");
                assert!(matches!(source, StorageError::Backend(_)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_sees_only_declared_arguments() {
        let mut builder = ToolRegistry::builder();
        builder.register(echo()).unwrap();
        builder
            .register(ToolDescriptor::new(
                "inspect",
                "Return the decoded arguments",
                InputSchema::new(vec![ParamSpec::optional("n", ParamKind::Integer, "n")]),
                |args: Value| async move { Ok(CallToolResult::success(vec![Content::text(args.to_string())])) },
            ))
            .unwrap();
        let registry = builder.build();

        let result = registry
            .invoke("inspect", Some(&json!({"n": 3.0, "junk": "x"})))
            .await
            .unwrap();
        assert_eq!(text(&result), r#"{"n":3}"#);
    }

    #[test]
    fn list_preserves_registration_order() {
        let mut builder = ToolRegistry::builder();
        builder.register(echo()).unwrap();
        builder
            .register(ToolDescriptor::new(
                "noop",
                "Nothing",
                InputSchema::empty(),
                |_args: Value| async { Ok(CallToolResult::success(vec![])) },
            ))
            .unwrap();
        let registry = builder.build();
        let names: Vec<_> = registry.list().into_iter().map(|t| t.name.to_string()).collect();
        assert_eq!(names, vec!["echo", "noop"]);
    }
}
