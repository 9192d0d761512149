// Copyright (c) 2024-2026 Gro Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Tool dispatch.
//!
//! The registry is the seam between the scheduler and whatever implements a
//! tool: built-ins, MCP servers, or plugin-provided handlers.  Tool failures
//! are reported to the model as the tool result ("Error: …"); they never
//! crash the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use gro_model::{ToolCall, ToolSchema};

/// Where a tool handler came from; dispatch is identical, but errors are
/// classified differently (MCP failures are retryable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOrigin {
    Builtin,
    Mcp,
    Plugin,
}

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema of the parameters object.
    fn parameters(&self) -> Value;
    async fn execute(&self, args: Value) -> anyhow::Result<String>;
    /// Per-tool execution timeout.
    fn timeout(&self) -> Duration {
        Duration::from_secs(3600)
    }
}

/// The outcome handed back to the scheduler for one call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub content: String,
    pub is_error: bool,
}

#[derive(Default)]
pub struct ToolRegistry {
    handlers: HashMap<String, (ToolOrigin, Arc<dyn ToolHandler>)>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, origin: ToolOrigin, handler: Arc<dyn ToolHandler>) {
        self.handlers
            .insert(handler.name().to_string(), (origin, handler));
    }

    pub fn has(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Schemas in stable name order for the completion request.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let (_, handler) = &self.handlers[name];
                ToolSchema {
                    name: handler.name().to_string(),
                    description: handler.description().to_string(),
                    parameters: handler.parameters(),
                }
            })
            .collect()
    }

    /// Execute one call.  Arguments that fail to parse fall back to `{}`;
    /// handler errors, timeouts, and unknown tools become error results.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let Some((_, handler)) = self.handlers.get(&call.name) else {
            return ToolOutcome {
                content: format!("Error: unknown tool {:?}", call.name),
                is_error: true,
            };
        };
        let args: Value = serde_json::from_str(&call.arguments).unwrap_or_else(|_| {
            warn!(tool = %call.name, "unparseable tool arguments; using empty object");
            Value::Object(Default::default())
        });
        match tokio::time::timeout(handler.timeout(), handler.execute(args)).await {
            Ok(Ok(content)) => ToolOutcome {
                content,
                is_error: false,
            },
            Ok(Err(e)) => ToolOutcome {
                content: format!("Error: {e:#}"),
                is_error: true,
            },
            Err(_) => ToolOutcome {
                content: format!(
                    "Error: tool {:?} timed out after {}s",
                    call.name,
                    handler.timeout().as_secs()
                ),
                is_error: true,
            },
        }
    }
}

/// Listen-class tools are exempt from the sleep auto-wake and are the target
/// of the persistent-mode fairness check.
pub fn is_listen_tool(name: &str) -> bool {
    name == "listen" || name.ends_with("_listen")
}

// ─── Built-in: page search ───────────────────────────────────────────────────

/// Exact search over compacted memory pages.
pub struct PageSearchTool {
    store: Arc<std::sync::Mutex<gro_memory::PageStore>>,
}

impl PageSearchTool {
    pub fn new(store: Arc<std::sync::Mutex<gro_memory::PageStore>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ToolHandler for PageSearchTool {
    fn name(&self) -> &str {
        "memory_search"
    }

    fn description(&self) -> &str {
        "Exact substring search over compacted memory pages. Returns page ids \
         and snippets; load a page with @@ref('pg_...')@@ in your reply."
    }

    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Substring to search for" }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> anyhow::Result<String> {
        let query = args["query"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("missing required argument: query"))?;
        let pages = self
            .store
            .lock()
            .map_err(|_| anyhow::anyhow!("page store lock poisoned"))?
            .all()?;
        let hits = gro_memory::search_pages(&pages, query);
        if hits.is_empty() {
            return Ok(format!("No pages matched {query:?}."));
        }
        Ok(hits
            .into_iter()
            .map(|(id, snippet)| format!("{id}: …{snippet}…"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({ "type": "object", "properties": { "text": { "type": "string" } } })
        }
        async fn execute(&self, args: Value) -> anyhow::Result<String> {
            Ok(args["text"].as_str().unwrap_or("").to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "Always fails"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<String> {
            anyhow::bail!("deliberate failure")
        }
    }

    struct Slow;

    #[async_trait]
    impl ToolHandler for Slow {
        fn name(&self) -> &str {
            "slow"
        }
        fn description(&self) -> &str {
            "Sleeps forever"
        }
        fn parameters(&self) -> Value {
            serde_json::json!({ "type": "object" })
        }
        async fn execute(&self, _args: Value) -> anyhow::Result<String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
        fn timeout(&self) -> Duration {
            Duration::from_millis(20)
        }
    }

    fn call(name: &str, args: &str) -> ToolCall {
        ToolCall {
            id: "t1".into(),
            name: name.into(),
            arguments: args.into(),
        }
    }

    fn registry() -> ToolRegistry {
        let mut r = ToolRegistry::new();
        r.register(ToolOrigin::Builtin, Arc::new(Echo));
        r.register(ToolOrigin::Plugin, Arc::new(Failing));
        r.register(ToolOrigin::Mcp, Arc::new(Slow));
        r
    }

    #[tokio::test]
    async fn execute_returns_handler_output() {
        let out = registry().execute(&call("echo", r#"{"text":"hi"}"#)).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "hi");
    }

    #[tokio::test]
    async fn handler_error_becomes_error_result() {
        let out = registry().execute(&call("failing", "{}")).await;
        assert!(out.is_error);
        assert!(out.content.starts_with("Error:"));
        assert!(out.content.contains("deliberate failure"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error_result() {
        let out = registry().execute(&call("ghost", "{}")).await;
        assert!(out.is_error);
        assert!(out.content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn invalid_arguments_fall_back_to_empty_object() {
        let out = registry().execute(&call("echo", "{not json")).await;
        assert!(!out.is_error);
        assert_eq!(out.content, "", "echo of missing text is empty, not a crash");
    }

    #[tokio::test]
    async fn timeout_becomes_error_result() {
        let out = registry().execute(&call("slow", "{}")).await;
        assert!(out.is_error);
        assert!(out.content.contains("timed out"));
    }

    #[test]
    fn schemas_are_name_sorted() {
        let schemas = registry().schemas();
        let names: Vec<&str> = schemas.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["echo", "failing", "slow"]);
    }

    #[test]
    fn listen_tools_recognised() {
        assert!(is_listen_tool("listen"));
        assert!(is_listen_tool("inbox_listen"));
        assert!(!is_listen_tool("shell"));
    }

    #[tokio::test]
    async fn page_search_tool_finds_snippets() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(std::sync::Mutex::new(
            gro_memory::PageStore::open(dir.path()).unwrap(),
        ));
        store.lock().unwrap().create(gro_memory::Page::new(
            "user@t0",
            "alpha beta the-needle gamma",
            1,
            None,
            None,
        ));
        let tool = PageSearchTool::new(store);
        let out = tool
            .execute(serde_json::json!({ "query": "the-needle" }))
            .await
            .unwrap();
        assert!(out.contains("pg_"));
        assert!(out.contains("the-needle"));

        let miss = tool
            .execute(serde_json::json!({ "query": "zzz-absent" }))
            .await
            .unwrap();
        assert!(miss.contains("No pages matched"));
    }

    #[tokio::test]
    async fn page_search_requires_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(std::sync::Mutex::new(
            gro_memory::PageStore::open(dir.path()).unwrap(),
        ));
        let tool = PageSearchTool::new(store);
        assert!(tool.execute(serde_json::json!({})).await.is_err());
    }
}
