//! Mantis - Rust 智能桌面执行网关
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、过程事件与执行编排器
//! - **elicitation**: 危险操作的人机确认握手
//! - **intent**: 自然语言 → 结构化意图
//! - **jsonfix**: LLM 输出的 JSON 修复
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）
//! - **observability**: 日志初始化
//! - **plan**: 意图 + 工具目录 → 有序执行计划
//! - **sandbox**: Python 子进程沙箱（导入层 deny-list）
//! - **security**: 计划步骤的安全分类（客户端 + 服务端复用）
//! - **session**: 会话生命周期、工具传输与进程内端点

pub mod config;
pub mod core;
pub mod elicitation;
pub mod intent;
pub mod jsonfix;
pub mod llm;
pub mod observability;
pub mod plan;
pub mod sandbox;
pub mod security;
pub mod session;
