//! In-memory MCP connections and connectors for unit tests.

use crate::mcp::error::TransportError;
use crate::mcp::transport::{McpConnection, McpConnector, McpTransportKind};
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::Url;
use rust_mcp_schema::{CallToolResult, ListToolsResult, Tool};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub struct FakeConnection {
    kind: McpTransportKind,
    label: String,
    pages: Vec<Vec<Tool>>,
    tools_method: bool,
    list_error: Option<TransportError>,
    close_error: Option<TransportError>,
    pub closes: AtomicUsize,
    pub calls: Mutex<Vec<(String, Option<Map<String, Value>>)>>,
}

impl FakeConnection {
    pub fn new(kind: McpTransportKind) -> Self {
        Self {
            kind,
            label: String::new(),
            pages: Vec::new(),
            tools_method: true,
            list_error: None,
            close_error: None,
            closes: AtomicUsize::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Text returned by `call_tool`, so tests can tell servers apart.
    pub fn labelled(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self
    }

    pub fn with_pages(mut self, pages: Vec<Vec<Tool>>) -> Self {
        self.pages = pages;
        self
    }

    pub fn with_tools(self, tools: Vec<Tool>) -> Self {
        self.with_pages(vec![tools])
    }

    pub fn without_tools_method(mut self) -> Self {
        self.tools_method = false;
        self
    }

    pub fn failing_list(mut self, err: TransportError) -> Self {
        self.list_error = Some(err);
        self
    }

    pub fn failing_close(mut self, err: TransportError) -> Self {
        self.close_error = Some(err);
        self
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn call_names(&self) -> Vec<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[async_trait]
impl McpConnection for FakeConnection {
    fn kind(&self) -> McpTransportKind {
        self.kind
    }

    async fn list_tools(
        &self,
        cursor: Option<String>,
    ) -> Result<Option<ListToolsResult>, TransportError> {
        if let Some(err) = &self.list_error {
            return Err(err.clone());
        }
        if !self.tools_method {
            return Ok(None);
        }

        let index = cursor
            .as_deref()
            .and_then(|cursor| cursor.strip_prefix("page-"))
            .and_then(|index| index.parse::<usize>().ok())
            .unwrap_or(0);
        let tools = self.pages.get(index).cloned().unwrap_or_default();
        let next_cursor = (index + 1 < self.pages.len()).then(|| format!("page-{}", index + 1));

        Ok(Some(ListToolsResult {
            meta: None,
            next_cursor,
            tools,
        }))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<CallToolResult, TransportError> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((name.to_string(), arguments));
        let text = format!("{}:{name}", self.label);
        serde_json::from_value(json!({"content": [{"type": "text", "text": text}]}))
            .map_err(|err| TransportError::other(err.to_string()))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        match &self.close_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub enum Script {
    Connect(Arc<FakeConnection>),
    Fail(TransportError),
    Hang,
}

/// Connector whose behaviour is scripted per `(url, transport)` pair.
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<(String, McpTransportKind), Script>>,
    pub attempts: Mutex<Vec<(String, McpTransportKind, HeaderMap)>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, url: &str, kind: McpTransportKind, script: Script) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .insert((url.to_string(), kind), script);
        self
    }

    pub fn attempted(&self) -> Vec<(String, McpTransportKind)> {
        self.attempts
            .lock()
            .expect("attempts lock")
            .iter()
            .map(|(url, kind, _)| (url.clone(), *kind))
            .collect()
    }
}

#[async_trait]
impl McpConnector for FakeConnector {
    async fn connect(
        &self,
        kind: McpTransportKind,
        url: &Url,
        headers: HeaderMap,
    ) -> Result<Arc<dyn McpConnection>, TransportError> {
        self.attempts
            .lock()
            .expect("attempts lock")
            .push((url.to_string(), kind, headers));
        let script = self
            .scripts
            .lock()
            .expect("scripts lock")
            .get(&(url.to_string(), kind))
            .cloned();
        match script {
            Some(Script::Connect(connection)) => Ok(connection),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Hang) => std::future::pending().await,
            None => Err(TransportError::network("connection refused")),
        }
    }
}
