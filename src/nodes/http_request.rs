//! HTTP-request node.
//!
//! Builds a request from method, templated URL, templated headers, query
//! params and body; supports basic/bearer/api-key auth; retries transport
//! errors with linear backoff. An HTTP status ≥ 400 is reported as
//! `failed` with the response outputs attached, so fail-branch routing
//! can still read `status_code`/`body` downstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::dsl::NodeData;
use crate::events::NodeEvent;
use crate::nodes::{
    delegate_base, run_with_events, BaseNode, NodeBuildError, NodeError, NodeRunResult,
    WorkflowNode,
};
use crate::types::{new_var_map, ExecutionClass, NodeType};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Clone, Debug, Deserialize)]
struct HttpNodeData {
    #[serde(default)]
    title: String,
    #[serde(default)]
    method: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    headers: FxHashMap<String, String>,
    #[serde(default)]
    params: FxHashMap<String, String>,
    #[serde(default)]
    body: Option<BodyConfig>,
    #[serde(default)]
    authorization: Option<AuthConfig>,
    /// Transport timeout, seconds.
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default)]
    max_retries: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct BodyConfig {
    #[serde(default, rename = "type")]
    pub body_type: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthConfig {
    #[serde(default, rename = "type")]
    pub auth_type: String,
    #[serde(default)]
    pub config: FxHashMap<String, String>,
}

pub struct HttpRequestNode {
    base: BaseNode,
    data: HttpNodeData,
    client: reqwest::Client,
}

pub(crate) fn build(
    id: &str,
    raw: &Value,
    envelope: &NodeData,
) -> Result<Arc<dyn WorkflowNode>, NodeBuildError> {
    let data: HttpNodeData =
        serde_json::from_value(raw.clone()).map_err(|source| NodeBuildError::Parse {
            node_id: id.to_string(),
            source,
        })?;

    let timeout = Duration::from_secs(data.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS));
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| NodeBuildError::invalid(id, format!("http client: {e}")))?;

    Ok(Arc::new(HttpRequestNode {
        base: BaseNode::new(id, NodeType::HttpRequest, &data.title, ExecutionClass::Executable)
            .with_strategy_from(envelope),
        data,
        client,
    }))
}

impl HttpRequestNode {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeRunResult, NodeError> {
        let pool = &ctx.variable_pool;

        let mut url = pool.resolve_template(&self.data.url);
        if !self.data.params.is_empty() {
            let mut sep = if url.contains('?') { '&' } else { '?' };
            for (key, value) in &self.data.params {
                let value = pool.resolve_template(value);
                url.push(sep);
                url.push_str(key);
                url.push('=');
                url.push_str(&value);
                sep = '&';
            }
        }

        let method = if self.data.method.is_empty() {
            reqwest::Method::GET
        } else {
            self.data
                .method
                .to_uppercase()
                .parse()
                .map_err(|_| NodeError::msg(format!("invalid HTTP method: {}", self.data.method)))?
        };

        let body = self
            .data
            .body
            .as_ref()
            .filter(|b| b.body_type != "none")
            .map(|b| pool.resolve_template(&b.data));

        let max_retries = self.data.max_retries.unwrap_or(1).max(1);
        let mut last_err = None;
        let mut response = None;

        for attempt in 0..max_retries {
            if attempt > 0 {
                tracing::info!(
                    node_id = %self.id(),
                    attempt = attempt + 1,
                    max = max_retries,
                    "retrying HTTP request"
                );
                tokio::time::sleep(Duration::from_secs(u64::from(attempt))).await;
            }

            let mut request = self.client.request(method.clone(), &url);
            for (key, value) in &self.data.headers {
                request = request.header(key, pool.resolve_template(value));
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
                if !self.data.headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    let content_type = match self.data.body.as_ref().map(|b| b.body_type.as_str()) {
                        Some("json") => "application/json",
                        Some("x-www-form-urlencoded") => "application/x-www-form-urlencoded",
                        _ => "text/plain",
                    };
                    request = request.header("Content-Type", content_type);
                }
            }
            request = self.apply_auth(request, pool);

            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
                result = request.send() => match result {
                    Ok(resp) => {
                        response = Some(resp);
                        break;
                    }
                    Err(err) => last_err = Some(err),
                },
            }
        }

        let Some(response) = response else {
            let err = last_err.map(|e| e.to_string()).unwrap_or_default();
            return Ok(NodeRunResult::failed(format!(
                "HTTP request failed after {max_retries} attempts: {err}"
            )));
        };

        let status = response.status().as_u16();
        let mut headers = new_var_map();
        for (name, value) in response.headers() {
            headers.insert(
                name.to_string(),
                Value::String(value.to_str().unwrap_or_default().to_string()),
            );
        }
        let body_text = response
            .text()
            .await
            .map_err(|e| NodeError::msg(format!("read response: {e}")))?;

        let mut outputs = new_var_map();
        outputs.insert("status_code".to_string(), Value::from(status));
        outputs.insert("body".to_string(), Value::String(body_text.clone()));
        outputs.insert(
            "headers".to_string(),
            Value::Object(
                headers
                    .into_iter()
                    .collect::<serde_json::Map<String, Value>>(),
            ),
        );
        if let Ok(json_body) = serde_json::from_str::<Value>(&body_text) {
            outputs.insert("json".to_string(), json_body);
        }

        if status >= 400 {
            return Ok(NodeRunResult::failed_with_outputs(
                format!("HTTP {status}: {body_text}"),
                outputs,
            ));
        }

        Ok(NodeRunResult::succeeded(outputs))
    }

    fn apply_auth(
        &self,
        request: reqwest::RequestBuilder,
        pool: &crate::vars::VariablePool,
    ) -> reqwest::RequestBuilder {
        let Some(auth) = &self.data.authorization else {
            return request;
        };
        let get = |key: &str| {
            auth.config
                .get(key)
                .map(|v| pool.resolve_template(v))
                .unwrap_or_default()
        };
        match auth.auth_type.as_str() {
            "bearer" => request.bearer_auth(get("token")),
            "basic" => {
                let username = get("username");
                let password = get("password");
                request.basic_auth(username, Some(password))
            }
            "api-key" => {
                let key = get("key");
                let value = get("value");
                let header = auth
                    .config
                    .get("header")
                    .filter(|h| !h.is_empty())
                    .cloned()
                    .unwrap_or_else(|| key.clone());
                request.header(header, value)
            }
            _ => request,
        }
    }
}

#[async_trait]
impl WorkflowNode for HttpRequestNode {
    delegate_base!();

    async fn run(self: Arc<Self>, ctx: ExecutionContext) -> flume::Receiver<NodeEvent> {
        let node = self.clone();
        run_with_events(
            self.id().to_string(),
            self.node_type(),
            self.title().to_string(),
            async move { node.execute(ctx).await },
        )
    }
}
