use std::fmt;

/// 计算单元（compute unit）的统一错误类型
#[derive(Debug)]
pub enum CuError {
    /// 远端拉取失败（定义、模块、消息页）
    Fetch(FetchError),
    /// 消息日志合并破坏了 nonce 单调/连续性
    LogCorruption(LogCorruption),
    /// checkpoint 指针存在，但对应的内存快照已被淘汰或从未写入
    SnapshotMissing { process_id: String, nonce: u64 },
    /// 状态转移函数执行失败
    Evaluation(EvaluationFault),
    /// "already past" 分支在持久化结果库中找不到历史结果
    ResultNotFound {
        process_id: String,
        message_id: String,
        nonce: u64,
    },
    /// 进程注册失败或被中途取消
    Registration(String),
    /// 配置错误
    Config(ConfigError),
    /// 解析错误
    Parse(ParseError),
    /// IO 错误
    Io(std::io::Error),
    /// 其他错误
    Other(String),
}

/// 网络拉取错误
#[derive(Debug)]
pub enum FetchError {
    /// 传输层失败（连接、超时等）
    Network(String),
    /// 远端返回非 2xx 状态码
    Status { url: String, status: u16, message: String },
    /// 响应体无法按预期格式解析
    InvalidResponse(String),
}

/// 日志合并违反不变式的具体形态
#[derive(Debug)]
pub enum LogCorruption {
    /// 批次内或与已缓存尾部重复
    Duplicate { process_id: String, nonce: u64 },
    /// nonce 倒退
    Decreasing {
        process_id: String,
        previous: u64,
        next: u64,
    },
    /// nonce 跳号
    Gap {
        process_id: String,
        previous: u64,
        next: u64,
    },
}

/// 单条消息执行失败
#[derive(Debug)]
pub enum EvaluationFault {
    /// 模块字节码无法实例化
    Instantiate { module_id: String, message: String },
    /// 处理某条消息时状态转移函数报错
    Handle {
        message_id: String,
        nonce: u64,
        message: String,
    },
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),
    /// 配置解析失败
    ParseFailed(String),
    /// 配置值无效
    InvalidValue { field: String, message: String },
}

/// 解析错误
#[derive(Debug)]
pub enum ParseError {
    /// JSON 解析错误
    JsonError(String),
    /// 缺少必需的 tag
    MissingTag { message_id: String, tag: String },
    /// tag 值无法解析为数字
    InvalidTag {
        message_id: String,
        tag: String,
        value: String,
    },
}

impl fmt::Display for CuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CuError::Fetch(e) => write!(f, "Fetch failed: {}", e),
            CuError::LogCorruption(e) => write!(f, "Log corruption: {}", e),
            CuError::SnapshotMissing { process_id, nonce } => {
                write!(f, "Snapshot missing for {}:{}", process_id, nonce)
            }
            CuError::Evaluation(e) => write!(f, "Evaluation fault: {}", e),
            CuError::ResultNotFound {
                process_id,
                message_id,
                nonce,
            } => write!(
                f,
                "Result for {}:{}:{} not found in result store",
                process_id, message_id, nonce
            ),
            CuError::Registration(msg) => write!(f, "Registration error: {}", msg),
            CuError::Config(e) => write!(f, "Config Error: {}", e),
            CuError::Parse(e) => write!(f, "Parse Error: {}", e),
            CuError::Io(e) => write!(f, "IO Error: {}", e),
            CuError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Network(msg) => write!(f, "Network error: {}", msg),
            FetchError::Status {
                url,
                status,
                message,
            } => write!(f, "{} returned {}: {}", url, status, message),
            FetchError::InvalidResponse(msg) => write!(f, "Invalid response: {}", msg),
        }
    }
}

impl fmt::Display for LogCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCorruption::Duplicate { process_id, nonce } => {
                write!(f, "duplicate nonce {} for {}", nonce, process_id)
            }
            LogCorruption::Decreasing {
                process_id,
                previous,
                next,
            } => write!(
                f,
                "nonce decreased from {} to {} for {}",
                previous, next, process_id
            ),
            LogCorruption::Gap {
                process_id,
                previous,
                next,
            } => write!(
                f,
                "nonce gap between {} and {} for {}",
                previous, next, process_id
            ),
        }
    }
}

impl fmt::Display for EvaluationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvaluationFault::Instantiate { module_id, message } => {
                write!(f, "module {} failed to load: {}", module_id, message)
            }
            EvaluationFault::Handle {
                message_id,
                nonce,
                message,
            } => write!(f, "message {} (nonce {}) failed: {}", message_id, nonce, message),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseFailed(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, message } => {
                write!(f, "Invalid config value for '{}': {}", field, message)
            }
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::JsonError(msg) => write!(f, "JSON parse error: {}", msg),
            ParseError::MissingTag { message_id, tag } => {
                write!(f, "message {} has no '{}' tag", message_id, tag)
            }
            ParseError::InvalidTag {
                message_id,
                tag,
                value,
            } => write!(
                f,
                "message {} has invalid '{}' tag value '{}'",
                message_id, tag, value
            ),
        }
    }
}

impl std::error::Error for CuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CuError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for FetchError {}
impl std::error::Error for LogCorruption {}
impl std::error::Error for EvaluationFault {}
impl std::error::Error for ConfigError {}
impl std::error::Error for ParseError {}

impl From<std::io::Error> for CuError {
    fn from(err: std::io::Error) -> Self {
        CuError::Io(err)
    }
}

impl From<reqwest::Error> for CuError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CuError::Fetch(FetchError::Network("Request timeout".to_string()))
        } else if err.is_connect() {
            CuError::Fetch(FetchError::Network(format!("Connection failed: {}", err)))
        } else if err.is_decode() {
            CuError::Fetch(FetchError::InvalidResponse(err.to_string()))
        } else {
            CuError::Fetch(FetchError::Network(err.to_string()))
        }
    }
}

impl From<serde_json::Error> for CuError {
    fn from(err: serde_json::Error) -> Self {
        CuError::Parse(ParseError::JsonError(err.to_string()))
    }
}

impl From<serde_yaml::Error> for CuError {
    fn from(err: serde_yaml::Error) -> Self {
        CuError::Config(ConfigError::ParseFailed(err.to_string()))
    }
}

impl From<FetchError> for CuError {
    fn from(err: FetchError) -> Self {
        CuError::Fetch(err)
    }
}

impl From<LogCorruption> for CuError {
    fn from(err: LogCorruption) -> Self {
        CuError::LogCorruption(err)
    }
}

impl From<EvaluationFault> for CuError {
    fn from(err: EvaluationFault) -> Self {
        CuError::Evaluation(err)
    }
}

impl From<ConfigError> for CuError {
    fn from(err: ConfigError) -> Self {
        CuError::Config(err)
    }
}

impl From<ParseError> for CuError {
    fn from(err: ParseError) -> Self {
        CuError::Parse(err)
    }
}

// 便捷的 Result 类型别名
pub type Result<T> = std::result::Result<T, CuError>;
