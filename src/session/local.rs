//! 进程内工具端点
//!
//! 远程端点的本地重述：execute_python（服务端安全检查 → 确认 → 沙箱）、
//! system_command（命令检查 → 确认 → sh -c 带超时）、file_operations
//! （create/read/delete/list/mkdir，delete 需确认）。返回结构与远端一致：
//! `{success, result, error, path}` 或 `{output, error}`。

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::sandbox::SandboxExecutor;
use crate::security::SecurityClassifier;
use crate::session::transport::{ConfirmHandler, ContentItem, ToolDescriptor, ToolTransport};

/// 进程内端点：持服务端安全检查器与沙箱执行器
pub struct LocalEndpoint {
    classifier: SecurityClassifier,
    sandbox: SandboxExecutor,
    /// file_operations 的根目录（相对路径基于此解析）
    root: PathBuf,
    timeout_secs: u64,
    /// 沙箱流式输出的出口（可选）
    output_tx: Option<mpsc::UnboundedSender<String>>,
}

impl LocalEndpoint {
    pub fn new(classifier: SecurityClassifier, sandbox: SandboxExecutor, timeout_secs: u64) -> Self {
        Self {
            classifier,
            sandbox,
            root: PathBuf::from("."),
            timeout_secs,
            output_tx: None,
        }
    }

    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_output(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    /// 服务端安全门：危险则走确认回调，拒绝返回「用户取消执行」
    async fn gate(
        &self,
        reason: Option<String>,
        confirm: &Option<ConfirmHandler>,
    ) -> Option<Value> {
        let reason = reason?;
        let approved = match confirm {
            Some(handler) => handler(reason.clone()).await,
            None => false, // 没有回调，默认拒绝
        };
        if approved {
            None
        } else {
            tracing::info!(reason = %reason, "server-side gate declined");
            Some(json!({"success": false, "error": "用户取消执行"}))
        }
    }

    async fn execute_python(&self, args: &Value, confirm: &Option<ConfirmHandler>) -> Value {
        let code = args.get("code").and_then(|v| v.as_str()).unwrap_or("");

        let verdict = self.classifier.classify_code(code);
        if let Some(declined) = self.gate(verdict.reason, confirm).await {
            return declined;
        }

        let outcome = self.sandbox.execute(code, self.output_tx.clone()).await;
        json!({"output": outcome.output, "error": outcome.error})
    }

    async fn system_command(&self, args: &Value, confirm: &Option<ConfirmHandler>) -> Value {
        let command = args.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if command.is_empty() {
            return json!({"success": false, "error": "命令为空"});
        }

        let verdict = self.classifier.classify_command(command);
        if let Some(declined) = self.gate(verdict.reason, confirm).await {
            return declined;
        }

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = tokio::process::Command::new("cmd");
            c.args(["/C", command]);
            c
        } else {
            let mut c = tokio::process::Command::new("sh");
            c.args(["-c", command]);
            c
        };

        let output = tokio::time::timeout(
            std::time::Duration::from_secs(self.timeout_secs),
            cmd.output(),
        )
        .await;

        match output {
            Ok(Ok(out)) => {
                let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
                let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                if out.status.success() {
                    json!({"success": true, "result": stdout})
                } else {
                    json!({"success": false, "error": format!("退出 {:?}: {}", out.status.code(), stderr)})
                }
            }
            Ok(Err(e)) => json!({"success": false, "error": format!("执行失败: {}", e)}),
            Err(_) => json!({"success": false, "error": format!("命令超时（{}秒）", self.timeout_secs)}),
        }
    }

    async fn file_operations(&self, args: &Value, confirm: &Option<ConfirmHandler>) -> Value {
        let operation = args.get("operation").and_then(|v| v.as_str()).unwrap_or("");
        let path_arg = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        if path_arg.is_empty() {
            return json!({"success": false, "error": "缺少 path 参数"});
        }
        let path = self.resolve_path(path_arg);
        let display = path.display().to_string();

        match operation {
            "create" => {
                let content = args.get("content").and_then(|v| v.as_str()).unwrap_or("");
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                match tokio::fs::write(&path, content).await {
                    Ok(()) => json!({"success": true, "result": "文件创建成功", "path": display}),
                    Err(e) => json!({"success": false, "error": format!("创建失败: {}", e)}),
                }
            }
            "read" => match tokio::fs::read_to_string(&path).await {
                Ok(content) => json!({"success": true, "result": content, "path": display}),
                Err(e) => json!({"success": false, "error": format!("读取失败: {}", e)}),
            },
            "delete" => {
                let reason = format!(
                    "检测到文件删除操作，要删除的文件: {}，是否确认执行？",
                    display
                );
                if let Some(declined) = self.gate(Some(reason), confirm).await {
                    return declined;
                }
                let result = if path.is_dir() {
                    tokio::fs::remove_dir_all(&path).await
                } else {
                    tokio::fs::remove_file(&path).await
                };
                match result {
                    Ok(()) => json!({"success": true, "result": "文件删除成功", "path": display}),
                    Err(e) => json!({"success": false, "error": format!("删除失败: {}", e)}),
                }
            }
            "list" => match std::fs::read_dir(&path) {
                Ok(entries) => {
                    let names: Vec<String> = entries
                        .filter_map(|e| e.ok())
                        .map(|e| e.file_name().to_string_lossy().into_owned())
                        .collect();
                    json!({"success": true, "result": names.join("\n"), "path": display})
                }
                Err(e) => json!({"success": false, "error": format!("列举失败: {}", e)}),
            },
            "mkdir" => {
                if path.exists() {
                    // 上层把「文件夹已存在」视为成功
                    json!({"success": false, "error": "文件夹已存在", "path": display})
                } else {
                    match tokio::fs::create_dir_all(&path).await {
                        Ok(()) => json!({"success": true, "result": "文件夹创建成功", "path": display}),
                        Err(e) => json!({"success": false, "error": format!("创建失败: {}", e)}),
                    }
                }
            }
            other => json!({"success": false, "error": format!("未知操作: {}", other)}),
        }
    }
}

#[async_trait]
impl ToolTransport for LocalEndpoint {
    async fn open(&self) -> Result<(), String> {
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
        Ok(vec![
            ToolDescriptor {
                name: "execute_python".to_string(),
                description: "执行 Python 代码（沙箱内，导入层 deny-list）".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string", "description": "要执行的 Python 代码"}
                    },
                    "required": ["code"]
                }),
            },
            ToolDescriptor {
                name: "system_command".to_string(),
                description: "执行系统命令（破坏性命令需人工确认）".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "command": {"type": "string", "description": "要执行的命令"}
                    },
                    "required": ["command"]
                }),
            },
            ToolDescriptor {
                name: "file_operations".to_string(),
                description: "文件操作：create/read/delete/list/mkdir".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "operation": {"type": "string", "description": "操作类型"},
                        "path": {"type": "string", "description": "目标路径"},
                        "content": {"type": "string", "description": "create 时写入的内容"}
                    },
                    "required": ["operation", "path"]
                }),
            },
        ])
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        confirm: Option<ConfirmHandler>,
    ) -> Result<Vec<ContentItem>, String> {
        let result = match name {
            "execute_python" => self.execute_python(&args, &confirm).await,
            "system_command" => self.system_command(&args, &confirm).await,
            "file_operations" => self.file_operations(&args, &confirm).await,
            other => return Err(format!("Unknown tool: {}", other)),
        };
        Ok(vec![ContentItem::json(&result)])
    }
}
