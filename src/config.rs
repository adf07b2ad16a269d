//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MANTIS__*` 覆盖（双下划线表示嵌套，
//! 如 `MANTIS__SERVER__PORT=9000`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::AgentError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub security: SecuritySection,
    #[serde(default)]
    pub sandbox: SandboxSection,
}

/// [server] 段：工具端点位置与类型
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// 端点类型：local（进程内）/ http（远程）
    pub endpoint: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8765,
            endpoint: "local".to_string(),
        }
    }
}

impl ServerSection {
    pub fn url(&self) -> String {
        format!("http://{}:{}/rpc", self.host, self.port)
    }
}

/// [client] 段：分发超时、重试与确认等待
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// 单次工具调用超时（秒）
    pub timeout_secs: u64,
    /// 工具分发重试次数（含首次）
    pub retry_attempts: u32,
    /// 重试间固定延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 确认握手无应答自动拒绝的等待（秒）
    pub elicitation_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            elicitation_timeout_secs: 30,
        }
    }
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai；优先级由 API Key 与 provider 共同决定
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default)]
    pub deepseek: LlmDeepSeekSection,
    #[serde(default)]
    pub openai: LlmOpenAiSection,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmDeepSeekSection {
    pub model: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LlmOpenAiSection {
    pub model: Option<String>,
}

/// [security] 段：危险系统命令覆盖表（叠加在内置正则表之上）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySection {
    pub dangerous_commands: Vec<String>,
}

impl Default for SecuritySection {
    fn default() -> Self {
        Self {
            dangerous_commands: vec![
                "rm -rf".into(),
                "format".into(),
                "shutdown".into(),
                "reboot".into(),
            ],
        }
    }
}

/// [sandbox] 段：代码解释器路径
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    pub interpreter: String,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 MANTIS__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MANTIS__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, AgentError> {
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
        config::Environment::with_prefix("MANTIS")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder
        .build()
        .map_err(|e| AgentError::Config(e.to_string()))?;
    c.try_deserialize()
        .map_err(|e| AgentError::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.server.port, 8765);
        assert_eq!(cfg.client.retry_attempts, 3);
        assert_eq!(cfg.client.elicitation_timeout_secs, 30);
        assert!(cfg
            .security
            .dangerous_commands
            .iter()
            .any(|c| c == "rm -rf"));
        assert_eq!(cfg.server.url(), "http://localhost:8765/rpc");
    }

    #[test]
    fn malformed_file_reports_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "server = \"不是表\"").unwrap();
        let err = load_config(Some(path)).unwrap_err();
        assert!(matches!(err, AgentError::Config(_)));
    }
}
