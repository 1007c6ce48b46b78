//! 编排配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `A2A__*` 覆盖（双下划线表示嵌套，如 `A2A__INVOKER__DEFAULT_TIMEOUT_MS=5000`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub invoker: InvokerSection,
    #[serde(default)]
    pub trace: TraceSection,
    #[serde(default)]
    pub retry: RetrySection,
}

/// [context] 段：调用深度上限、根上下文的调用方与权限白名单
#[derive(Debug, Clone, Deserialize)]
pub struct ContextSection {
    /// 超过该深度的子上下文创建失败（防止工具递归失控）
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// 根上下文默认调用方名称
    #[serde(default = "default_caller")]
    pub caller: String,
    /// 根上下文默认权限白名单，"*" 表示全部放行
    #[serde(default = "default_permissions")]
    pub default_permissions: Vec<String>,
    #[serde(default = "default_true")]
    pub tracing_enabled: bool,
}

fn default_max_depth() -> u32 {
    50
}

fn default_caller() -> String {
    "orchestrator".to_string()
}

fn default_permissions() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_true() -> bool {
    true
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            caller: default_caller(),
            default_permissions: default_permissions(),
            tracing_enabled: true,
        }
    }
}

/// [invoker] 段：全局默认超时、是否合并并发的相同调用
#[derive(Debug, Clone, Deserialize)]
pub struct InvokerSection {
    /// 单次工具调用超时（毫秒），调用参数与注册策略均未指定时使用
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub dedup: bool,
}

fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for InvokerSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            dedup: true,
        }
    }
}

impl InvokerSection {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// [trace] 段：span / 事件缓冲上限（0 表示不限）
#[derive(Debug, Clone, Deserialize)]
pub struct TraceSection {
    #[serde(default = "default_trace_capacity")]
    pub capacity: usize,
}

fn default_trace_capacity() -> usize {
    10_000
}

impl Default for TraceSection {
    fn default() -> Self {
        Self {
            capacity: default_trace_capacity(),
        }
    }
}

impl TraceSection {
    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }
}

/// [retry] 段：retry 策略下的默认重试参数
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    5_000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 A2A__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 A2A__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<OrchestratorConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("A2A")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("context.default_permissions")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
