//! 计算单元配置
//!
//! 支持两种来源，环境变量优先级更高：
//! ```text
//! CU_SU_URL=http://127.0.0.1:9000
//! CU_GATEWAY_URL=https://arweave.net
//! CU_ENGINE_URL=http://127.0.0.1:6363
//! CU_COOLDOWN_MS=10000
//! CU_EVICTION_GRACE_MS=10000
//! CU_FETCH_TIMEOUT_MS=30000
//! CU_RESULTS_PATH=~/.echo-cu/results.json
//! CU_BROADCAST_PORT=9100
//! CU_FAILURE_POLICY=skip|abort
//! CU_ALLOWED_OWNERS=addr1,addr2
//! ```
//! 以及 YAML 文件（字段名同结构体，全部可选）。

use crate::error::{ConfigError, Result};
use crate::eval::FailurePolicy;
use dotenv::dotenv;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CuConfig {
    /// 调度器（sequencer）地址，提供消息分页与进程定义
    pub su_url: String,
    /// 模块字节码网关地址
    pub gateway_url: String,
    /// 执行引擎 sidecar 地址（仅命令行使用的 [`crate::engine::RemoteEngine`]）
    pub engine_url: String,
    /// 后台更新循环每轮之间的冷却时间（毫秒）
    pub cooldown_ms: u64,
    /// 被取代的快照在淘汰前保留的宽限期（毫秒）
    pub eviction_grace_ms: u64,
    /// 单次网络请求超时（毫秒），0 = 不限制
    pub fetch_timeout_ms: u64,
    /// 持久化结果库文件路径，未设置时使用进程内存
    pub results_path: Option<String>,
    /// WebSocket 广播端口，未设置时仅写日志
    pub broadcast_port: Option<u16>,
    pub failure_policy: FailurePolicy,
    /// 允许部署进程的 owner 地址白名单（空 = 不限制）
    pub allowed_owners: Vec<String>,
}

impl Default for CuConfig {
    fn default() -> Self {
        Self {
            su_url: "http://127.0.0.1:9000".to_string(),
            gateway_url: "https://arweave.net".to_string(),
            engine_url: "http://127.0.0.1:6363".to_string(),
            cooldown_ms: 10_000,
            eviction_grace_ms: 10_000,
            fetch_timeout_ms: 30_000,
            results_path: None,
            broadcast_port: None,
            failure_policy: FailurePolicy::Skip,
            allowed_owners: Vec::new(),
        }
    }
}

impl CuConfig {
    /// 从 YAML 文件加载，未出现的字段取默认值
    pub fn load(path: &str) -> Result<Self> {
        let file =
            std::fs::File::open(path).map_err(|_| ConfigError::FileNotFound(path.to_string()))?;
        let config: CuConfig = serde_yaml::from_reader(file)?;
        config.validate()?;
        Ok(config)
    }

    /// 在默认值之上叠加环境变量（会先读取 `.env`）
    pub fn from_env() -> Result<Self> {
        Self::default().with_env()
    }

    /// 用环境变量覆盖当前配置
    pub fn with_env(mut self) -> Result<Self> {
        dotenv().ok();

        if let Ok(v) = std::env::var("CU_SU_URL") {
            self.su_url = v;
        }
        if let Ok(v) = std::env::var("CU_GATEWAY_URL") {
            self.gateway_url = v;
        }
        if let Ok(v) = std::env::var("CU_ENGINE_URL") {
            self.engine_url = v;
        }
        if let Ok(v) = std::env::var("CU_COOLDOWN_MS") {
            self.cooldown_ms = parse_u64("CU_COOLDOWN_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CU_EVICTION_GRACE_MS") {
            self.eviction_grace_ms = parse_u64("CU_EVICTION_GRACE_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CU_FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = parse_u64("CU_FETCH_TIMEOUT_MS", &v)?;
        }
        if let Ok(v) = std::env::var("CU_RESULTS_PATH") {
            self.results_path = Some(v);
        }
        if let Ok(v) = std::env::var("CU_BROADCAST_PORT") {
            let port = v.parse::<u16>().map_err(|e| ConfigError::InvalidValue {
                field: "CU_BROADCAST_PORT".to_string(),
                message: e.to_string(),
            })?;
            self.broadcast_port = Some(port);
        }
        if let Ok(v) = std::env::var("CU_FAILURE_POLICY") {
            self.failure_policy = v.parse()?;
        }
        if let Ok(v) = std::env::var("CU_ALLOWED_OWNERS") {
            self.allowed_owners = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        for (field, url) in [
            ("su_url", &self.su_url),
            ("gateway_url", &self.gateway_url),
            ("engine_url", &self.engine_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("'{}' is not an http(s) url", url),
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn su_url(mut self, url: impl Into<String>) -> Self {
        self.su_url = url.into();
        self
    }

    pub fn gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }

    pub fn engine_url(mut self, url: impl Into<String>) -> Self {
        self.engine_url = url.into();
        self
    }

    pub fn results_path(mut self, path: impl Into<String>) -> Self {
        self.results_path = Some(path.into());
        self
    }

    pub fn broadcast_port(mut self, port: u16) -> Self {
        self.broadcast_port = Some(port);
        self
    }

    pub fn cooldown_ms(mut self, ms: u64) -> Self {
        self.cooldown_ms = ms;
        self
    }

    pub fn eviction_grace_ms(mut self, ms: u64) -> Self {
        self.eviction_grace_ms = ms;
        self
    }

    pub fn fetch_timeout_ms(mut self, ms: u64) -> Self {
        self.fetch_timeout_ms = ms;
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn allowed_owners(mut self, owners: Vec<String>) -> Self {
        self.allowed_owners = owners;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_millis(self.eviction_grace_ms)
    }

    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_ms > 0).then(|| Duration::from_millis(self.fetch_timeout_ms))
    }
}

fn parse_u64(field: &str, value: &str) -> Result<u64> {
    value.trim().parse::<u64>().map_err(|e| {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: e.to_string(),
        }
        .into()
    })
}
