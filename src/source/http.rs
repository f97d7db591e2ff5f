use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::config::CuConfig;
use crate::error::{FetchError, Result};

use super::{ArtifactSource, MessagePage, MessageSource, Node, PageQuery, RawProcess};

/// 基于 HTTP 的调度器/网关客户端
///
/// 端点：
/// - `GET {su_url}/{process_id}?from=..&to=..` 分页消息
/// - `GET {su_url}/{message_id}?process-id=..` 单条消息
/// - `GET {su_url}/processes/{process_id}` 进程定义
/// - `GET {gateway_url}/{module_id}` 模块字节码
///
/// 所有请求共用一个带超时的 `reqwest::Client`。非 2xx 响应一律转为
/// [`FetchError::Status`]，这里不做重试。
pub struct HttpSequencer {
    client: Client,
    su_url: String,
    gateway_url: String,
}

impl HttpSequencer {
    pub fn new(
        su_url: impl Into<String>,
        gateway_url: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            su_url: su_url.into().trim_end_matches('/').to_string(),
            gateway_url: gateway_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn from_config(config: &CuConfig) -> Result<Self> {
        Self::new(&config.su_url, &config.gateway_url, config.fetch_timeout())
    }

    async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response> {
        trace!(url = %url, ?query, "GET");
        let response = self.client.get(url).query(query).send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(FetchError::Status {
                url: url.to_string(),
                status,
                message,
            }
            .into());
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let response = self.get(url, query).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()).into())
    }
}

#[async_trait]
impl MessageSource for HttpSequencer {
    async fn fetch_page(&self, process_id: &str, query: &PageQuery) -> Result<MessagePage> {
        let url = format!("{}/{}", self.su_url, process_id);
        let mut params = vec![("from", query.from.clone().unwrap_or_else(|| "0".to_string()))];
        if let Some(to) = query.to {
            params.push(("to", to.to_string()));
        }
        let page: MessagePage = self.get_json(&url, &params).await?;
        debug!(
            process_id = %process_id,
            edges = page.edges.len(),
            has_next_page = page.page_info.has_next_page,
            "消息页已拉取"
        );
        Ok(page)
    }

    async fn fetch_message(&self, process_id: &str, message_id: &str) -> Result<Node> {
        let url = format!("{}/{}", self.su_url, message_id);
        self.get_json(&url, &[("process-id", process_id.to_string())])
            .await
    }
}

#[async_trait]
impl ArtifactSource for HttpSequencer {
    async fn fetch_process(&self, process_id: &str) -> Result<RawProcess> {
        let url = format!("{}/processes/{}", self.su_url, process_id);
        self.get_json(&url, &[]).await
    }

    async fn fetch_module(&self, module_id: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.gateway_url, module_id);
        let response = self.get(&url, &[]).await?;
        let bytes = response.bytes().await?;
        debug!(module_id = %module_id, size = bytes.len(), "模块字节码已下载");
        Ok(bytes.to_vec())
    }
}
