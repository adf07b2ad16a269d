//! 执行管线错误类型
//!
//! 失败自下而上以类型化结果传播，Orchestrator 边界之外永不 panic/raise：
//! 调用方总能拿到一个结果对象，最多携带 error 字段。

use thiserror::Error;

/// 管线各阶段可能出现的错误（连接、分发、确认、规划、沙箱、JSON）
#[derive(Error, Debug)]
pub enum AgentError {
    /// 无法建立或已丢失会话通道；下次使用时触发一次隐式重连
    #[error("Connection error: {0}")]
    Connection(String),

    /// 工具分发失败（已含重试后的末次失败）
    #[error("Tool invocation failed: {0}")]
    ToolInvocation(String),

    /// 确认被拒绝或超时；对步骤与整个计划都是终态
    #[error("Cancelled by user")]
    UserCancelled,

    /// 生成的计划畸形或为空；本地以确定性回退计划恢复，不上抛给最终用户
    #[error("Planning error: {0}")]
    Planning(String),

    /// 沙箱内代码异常；端点以 error 字段带回，结果归一化时映射为本错误
    #[error("Sandbox execution error: {0}")]
    SandboxExecution(String),

    /// 生成后端返回的结构化输出畸形；先 repair_json，再回退硬编码默认值
    #[error("JSON format error: {0}")]
    JsonFormat(String),

    /// 确认握手违反 1:1 不变量（已有待确认请求时又发起新请求）
    #[error("Elicitation error: {0}")]
    Elicitation(String),

    #[error("Config error: {0}")]
    Config(String),
}
