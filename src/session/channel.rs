//! 会话通道：到工具端点的持久连接
//!
//! 跨多次用户请求存活。connect 幂等（已连接即刻成功返回，调用点可防御性
//! 调用）；失败时释放半建立资源并回到 Disconnected，可安全重试。
//! invoke_tool 在断线时先做一次隐式 connect。确认回调每个通道生命周期
//! 只安装一次。状态与工具目录用轻量互斥保护，不跨 await 持锁。

use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;
use serde_json::Value;

use crate::core::AgentError;
use crate::session::transport::{ConfirmHandler, ContentItem, ToolDescriptor, ToolTransport};

/// 连接状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// 归一化后的工具调用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolResultKind {
    /// 端点正常应答（payload 为解析后的 JSON 或原始文本）
    Response,
    /// 分发最终失败（payload 为错误描述）
    ToolError,
}

/// 工具调用结果：kind 与 payload 二选一语义，payload 不会同时是结果又是错误
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallResult {
    pub kind: ToolResultKind,
    pub payload: Value,
}

impl ToolCallResult {
    pub fn response(payload: Value) -> Self {
        Self {
            kind: ToolResultKind::Response,
            payload,
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            kind: ToolResultKind::ToolError,
            payload: Value::String(description.into()),
        }
    }
}

/// 会话通道：transport 之上的连接状态、工具目录缓存与确认回调
pub struct SessionChannel {
    transport: Arc<dyn ToolTransport>,
    state: Mutex<ConnectionState>,
    tools: Mutex<Vec<ToolDescriptor>>,
    confirm: Mutex<Option<ConfirmHandler>>,
}

impl SessionChannel {
    pub fn new(transport: Arc<dyn ToolTransport>) -> Self {
        Self {
            transport,
            state: Mutex::new(ConnectionState::Disconnected),
            tools: Mutex::new(Vec::new()),
            confirm: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    /// 安装确认回调；每个通道生命周期只安装一次，重复安装被忽略
    pub fn set_confirm_handler(&self, handler: ConfirmHandler) {
        let mut confirm = self.confirm.lock().unwrap();
        if confirm.is_some() {
            tracing::warn!("confirmation callback already installed, ignoring");
            return;
        }
        *confirm = Some(handler);
    }

    /// 连接到端点并缓存工具目录；幂等：已连接时是成功的 no-op
    pub async fn connect(&self) -> Result<(), AgentError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Connected {
                tracing::debug!("already connected, skipping handshake");
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        if let Err(e) = self.transport.open().await {
            // 释放半建立的资源，保持 Disconnected 以便重试
            self.transport.shutdown().await;
            *self.state.lock().unwrap() = ConnectionState::Disconnected;
            return Err(AgentError::Connection(e));
        }

        match self.transport.list_tools().await {
            Ok(tools) => {
                tracing::info!(count = tools.len(), "connected, tool catalog loaded");
                *self.tools.lock().unwrap() = tools;
                *self.state.lock().unwrap() = ConnectionState::Connected;
                Ok(())
            }
            Err(e) => {
                self.transport.shutdown().await;
                *self.state.lock().unwrap() = ConnectionState::Disconnected;
                Err(AgentError::Connection(e))
            }
        }
    }

    /// 关闭连接并清空目录
    pub async fn close(&self) {
        self.transport.shutdown().await;
        *self.state.lock().unwrap() = ConnectionState::Disconnected;
        self.tools.lock().unwrap().clear();
        tracing::info!("channel closed");
    }

    /// 当前工具目录快照
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools.lock().unwrap().clone()
    }

    /// 调用工具：断线时隐式 connect；传输失败报 ToolInvocation（可由上层重试）
    pub async fn invoke_tool(&self, name: &str, args: Value) -> Result<ToolCallResult, AgentError> {
        if self.state() != ConnectionState::Connected {
            self.connect().await?;
        }

        let confirm = self.confirm.lock().unwrap().clone();
        let items = self
            .transport
            .call_tool(name, args, confirm)
            .await
            .map_err(AgentError::ToolInvocation)?;

        Ok(normalize_content(&items))
    }
}

/// 内容项归一化：取首个内容项，text 尝试按 JSON 解析，失败保留原始文本
fn normalize_content(items: &[ContentItem]) -> ToolCallResult {
    let Some(first) = items.first() else {
        return ToolCallResult::response(Value::Null);
    };
    if let Some(text) = &first.text {
        if let Ok(parsed) = serde_json::from_str::<Value>(text) {
            if parsed.is_object() {
                return ToolCallResult::response(parsed);
            }
        }
        return ToolCallResult::response(Value::String(text.clone()));
    }
    if let Some(data) = &first.data {
        return ToolCallResult::response(data.clone());
    }
    ToolCallResult::response(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_parses_json_text() {
        let items = vec![ContentItem::text(r#"{"success": true, "result": "ok"}"#)];
        let r = normalize_content(&items);
        assert_eq!(r.kind, ToolResultKind::Response);
        assert_eq!(r.payload["success"], true);
    }

    #[test]
    fn normalize_keeps_plain_text() {
        let items = vec![ContentItem::text("纯文本结果")];
        let r = normalize_content(&items);
        assert_eq!(r.payload, Value::String("纯文本结果".to_string()));
    }

    #[test]
    fn normalize_empty_content_is_null() {
        let r = normalize_content(&[]);
        assert_eq!(r.payload, Value::Null);
    }
}
