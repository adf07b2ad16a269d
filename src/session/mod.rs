//! 会话层：连接生命周期与请求中断
//!
//! ExecutionSession 是构造后注入的会话对象，拥有到工具端点的通道与
//! 当前请求的取消令牌。每次新请求换发全新令牌，中断只影响当前请求。

pub mod channel;
pub mod local;
pub mod transport;

pub use channel::{ConnectionState, SessionChannel, ToolCallResult, ToolResultKind};
pub use local::LocalEndpoint;
pub use transport::{ConfirmHandler, ContentItem, HttpTransport, ToolDescriptor, ToolTransport};

use std::sync::Arc;
use std::sync::Mutex;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::AgentError;

/// 执行会话：通道 + 当前请求的取消令牌
///
/// 显式构造、显式注入，不做全局单例。
pub struct ExecutionSession {
    channel: SessionChannel,
    current: Mutex<CancellationToken>,
}

impl ExecutionSession {
    pub fn new(transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            channel: SessionChannel::new(transport),
            current: Mutex::new(CancellationToken::new()),
        }
    }

    /// 新请求开始：换发全新令牌并返回，旧令牌作废
    pub fn begin_request(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.current.lock().unwrap() = token.clone();
        token
    }

    /// 中断当前请求（步骤边界生效，不打断正在运行的步骤）
    pub fn interrupt(&self) {
        tracing::info!("interrupt requested");
        self.current.lock().unwrap().cancel();
    }

    pub fn set_confirm_handler(&self, handler: ConfirmHandler) {
        self.channel.set_confirm_handler(handler);
    }

    pub async fn connect(&self) -> Result<(), AgentError> {
        self.channel.connect().await
    }

    pub async fn close(&self) {
        self.channel.close().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.channel.state()
    }

    /// 当前工具目录（connect 之后才非空）
    pub fn tool_catalog(&self) -> Vec<ToolDescriptor> {
        self.channel.tools()
    }

    pub async fn invoke_tool(&self, name: &str, args: Value) -> Result<ToolCallResult, AgentError> {
        self.channel.invoke_tool(name, args).await
    }
}
