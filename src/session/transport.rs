//! 工具传输层：SessionChannel 之下的端点抽象
//!
//! ToolTransport 是通道与具体端点之间的缝：HttpTransport 走远程 HTTP 端点，
//! LocalEndpoint 走进程内工具（见 local.rs），测试用 MockTransport。
//! 服务端标记的危险操作以 elicitation 中间应答形式出现，经确认回调批准后
//! 携 confirm_token 重发。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 确认回调：远端（或本地端点的服务端检查）请求人工批准时调用
pub type ConfirmHandler =
    Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// 工具描述：名称、说明与参数 JSON Schema
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
}

/// 端点返回的原始内容项（text 或 data 至多其一）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ContentItem {
    pub fn text(t: impl Into<String>) -> Self {
        Self {
            text: Some(t.into()),
            data: None,
        }
    }

    /// 以 JSON 文本承载结构化结果（与远端 text 内容项同构）
    pub fn json(v: &Value) -> Self {
        Self::text(v.to_string())
    }
}

/// 端点抽象：打开/关闭连接、列举工具、调用工具
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// 建立到端点的连接（幂等性由 SessionChannel 保证）
    async fn open(&self) -> Result<(), String>;

    /// 释放连接资源
    async fn shutdown(&self);

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String>;

    /// 调用工具；confirm 为通道安装的确认回调，服务端标记危险时使用
    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        confirm: Option<ConfirmHandler>,
    ) -> Result<Vec<ContentItem>, String>;
}

/// 远端 HTTP 应答：正常内容或 elicitation 中间应答
#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    content: Option<Vec<ContentItem>>,
    #[serde(default)]
    tools: Option<Vec<ToolDescriptor>>,
    #[serde(default)]
    elicitation: Option<ElicitationPayload>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ElicitationPayload {
    message: String,
    token: String,
}

/// HTTP 端点传输：POST JSON 到 http://host:port/rpc
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }

    async fn post(&self, body: Value) -> Result<RpcResponse, String> {
        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("请求失败: {}", e))?;
        if !response.status().is_success() {
            return Err(format!("端点返回 {}", response.status()));
        }
        response
            .json::<RpcResponse>()
            .await
            .map_err(|e| format!("应答解析失败: {}", e))
    }
}

#[async_trait]
impl ToolTransport for HttpTransport {
    async fn open(&self) -> Result<(), String> {
        let resp = self
            .post(serde_json::json!({"method": "initialize"}))
            .await?;
        if let Some(err) = resp.error {
            return Err(err);
        }
        Ok(())
    }

    async fn shutdown(&self) {
        // 无状态 HTTP：无需显式挥手
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
        let resp = self
            .post(serde_json::json!({"method": "tools/list"}))
            .await?;
        if let Some(err) = resp.error {
            return Err(err);
        }
        Ok(resp.tools.unwrap_or_default())
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        confirm: Option<ConfirmHandler>,
    ) -> Result<Vec<ContentItem>, String> {
        let resp = self
            .post(serde_json::json!({
                "method": "tools/call",
                "params": {"name": name, "arguments": args},
            }))
            .await?;
        if let Some(err) = resp.error {
            return Err(err);
        }

        // 远端判定危险：走确认回调，批准后携 token 重发
        if let Some(elicit) = resp.elicitation {
            let approved = match &confirm {
                Some(handler) => handler(elicit.message.clone()).await,
                None => false, // 没有回调，默认拒绝
            };
            if !approved {
                return Ok(vec![ContentItem::json(&serde_json::json!({
                    "success": false,
                    "error": "用户取消执行",
                }))]);
            }
            let resp = self
                .post(serde_json::json!({
                    "method": "tools/call",
                    "params": {
                        "name": name,
                        "arguments": args,
                        "confirm_token": elicit.token,
                    },
                }))
                .await?;
            if let Some(err) = resp.error {
                return Err(err);
            }
            return Ok(resp.content.unwrap_or_default());
        }

        Ok(resp.content.unwrap_or_default())
    }
}
