//! 通过 HTTP 调用的外部执行引擎
//!
//! 命令行使用的 [`ExecutionEngine`] 实现：模块加载与状态转移都交给本地的
//! loader sidecar，计算单元只负责缓存与调度。
//!
//! - `PUT  {engine_url}/modules/{module_id}`：上传字节码（sidecar 按 id 缓存实例）
//! - `POST {engine_url}/modules/{module_id}/handle`：执行一条消息
//!
//! 请求体：
//! ```json
//! { "Memory": [0, 97, ...] | null, "Message": { "Id": "...", ... }, "Environment": { "Process": {...}, "Module": {...} } }
//! ```
//! 响应体即 [`HandleResponse`]（`Memory`、`Output`、`Messages`、`Spawns`、`Assignments`、`Error`）。

use crate::config::CuConfig;
use crate::error::{FetchError, Result};
use crate::eval::{ExecutionEngine, HandleResponse, ProcessHandle};
use crate::types::{Environment, Message};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct RemoteEngine {
    client: Client,
    base_url: String,
}

impl RemoteEngine {
    pub fn new(base_url: impl Into<String>, timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &CuConfig) -> Result<Self> {
        Self::new(&config.engine_url, config.fetch_timeout())
    }
}

#[async_trait]
impl ExecutionEngine for RemoteEngine {
    async fn instantiate(&self, module_id: &str, bytecode: &[u8]) -> Result<Arc<dyn ProcessHandle>> {
        let url = format!("{}/modules/{}", self.base_url, module_id);
        let response = self
            .client
            .put(&url)
            .header("content-type", "application/wasm")
            .body(bytecode.to_vec())
            .send()
            .await?;
        check_status(&url, response).await?;
        info!(module_id = %module_id, size = bytecode.len(), "🧩 模块已加载到执行引擎");
        Ok(Arc::new(RemoteHandle {
            client: self.client.clone(),
            url: format!("{url}/handle"),
        }))
    }
}

struct RemoteHandle {
    client: Client,
    url: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HandleRequest<'a> {
    memory: Option<&'a [u8]>,
    message: &'a Message,
    environment: &'a Environment,
}

#[async_trait]
impl ProcessHandle for RemoteHandle {
    async fn handle(
        &self,
        memory: Option<&[u8]>,
        message: &Message,
        env: &Environment,
    ) -> Result<HandleResponse> {
        let response = self
            .client
            .post(&self.url)
            .json(&HandleRequest {
                memory,
                message,
                environment: env,
            })
            .send()
            .await?;
        let response = check_status(&self.url, response).await?;
        let handled = response
            .json::<HandleResponse>()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        debug!(nonce = message.nonce, memory = handled.memory.len(), "执行引擎已返回");
        Ok(handled)
    }
}

async fn check_status(url: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(FetchError::Status {
        url: url.to_string(),
        status,
        message,
    }
    .into())
}
