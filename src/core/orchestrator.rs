//! 执行编排器：主控管线
//!
//! 负责单次请求的完整流水：意图解析 → 计划构建 → 逐步执行（安全分类 →
//! 必要时确认握手 → 带重试的工具分发 → 结果归一化）。步骤失败不终止
//! 计划（partial-failure），用户拒绝与中断是终态。run 永不 panic，
//! 调用方总能拿到一份 RunReport。

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::AppConfig;
use crate::core::events::ProgressEvent;
use crate::core::AgentError;
use crate::elicitation::ElicitationCoordinator;
use crate::intent::IntentResolver;
use crate::llm::{create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient};
use crate::plan::{Plan, PlanBuilder};
use crate::security::SecurityClassifier;
use crate::session::{ExecutionSession, ToolCallResult, ToolResultKind};

/// 从前端发往编排器的用户命令
#[derive(Debug, Clone)]
pub enum Command {
    /// 提交用户输入，触发一次完整执行
    Submit(String),
    /// 退出应用
    Quit,
}

/// 一次请求的终态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// 所有步骤执行完毕（允许含失败步骤）
    Completed,
    /// 用户拒绝确认或在步骤边界中断
    Cancelled,
    /// 管线本身失败（如无法连接端点）
    Failed,
}

/// 一次请求的执行报告
#[derive(Debug, Clone)]
pub struct RunReport {
    pub status: RunStatus,
    pub summary: String,
    pub step_results: Vec<String>,
}

/// 根据配置与环境变量选择 LLM 后端（DeepSeek / OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let use_deepseek = std::env::var("DEEPSEEK_API_KEY").is_ok()
        || (provider == "deepseek" && std::env::var("OPENAI_API_KEY").is_ok());
    let use_openai = std::env::var("OPENAI_API_KEY").is_ok() && provider != "deepseek";

    if use_deepseek {
        let model = cfg
            .llm
            .deepseek
            .model
            .clone()
            .unwrap_or_else(|| cfg.llm.model.clone());
        tracing::info!("Using DeepSeek LLM ({})", model);
        Arc::new(create_deepseek_client(Some(&model)))
    } else if use_openai {
        let model = cfg
            .llm
            .openai
            .model
            .clone()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let base = cfg.llm.base_url.as_deref();
        tracing::info!("Using OpenAI LLM ({})", model);
        Arc::new(OpenAiClient::new(
            base,
            &model,
            std::env::var("OPENAI_API_KEY").ok().as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider unknown, using Mock LLM");
        Arc::new(MockLlmClient::new())
    }
}

/// 编排器：持会话、解析器、规划器、安全分类器与确认协调器
pub struct Orchestrator {
    session: Arc<ExecutionSession>,
    resolver: IntentResolver,
    builder: PlanBuilder,
    classifier: SecurityClassifier,
    elicitation: Arc<ElicitationCoordinator>,
    retry_attempts: u32,
    retry_delay_ms: u64,
    event_tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Orchestrator {
    pub fn new(
        session: Arc<ExecutionSession>,
        llm: Arc<dyn LlmClient>,
        classifier: SecurityClassifier,
        elicitation: Arc<ElicitationCoordinator>,
        cfg: &AppConfig,
    ) -> Self {
        Self {
            session,
            resolver: IntentResolver::new(llm.clone()),
            builder: PlanBuilder::new(llm),
            classifier,
            elicitation,
            retry_attempts: cfg.client.retry_attempts.max(1),
            retry_delay_ms: cfg.client.retry_delay_ms,
            event_tx: None,
        }
    }

    /// 安装事件通道（进度事件的出口）
    pub fn set_event_sender(&mut self, tx: mpsc::UnboundedSender<ProgressEvent>) {
        self.elicitation.set_event_sender(tx.clone());
        self.event_tx = Some(tx);
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }

    /// 执行一次完整请求；永不 panic，失败也返回报告
    pub async fn run(&self, query: &str) -> RunReport {
        let token = self.session.begin_request();

        self.emit(ProgressEvent::ResolvingIntent {
            query: query.to_string(),
        });
        let intent = self.resolver.resolve(query).await;
        tracing::info!(kind = intent.kind.as_str(), confidence = intent.confidence, "intent resolved");
        self.emit(ProgressEvent::IntentResolved {
            kind: intent.kind.as_str().to_string(),
            confidence: intent.confidence,
        });

        // 连接失败是管线级失败，没有可执行的计划
        if let Err(e) = self.session.connect().await {
            let text = format!("无法连接到工具端点: {}", e);
            tracing::error!(error = %e, "connect failed");
            self.emit(ProgressEvent::Error { text: text.clone() });
            return RunReport {
                status: RunStatus::Failed,
                summary: text,
                step_results: Vec::new(),
            };
        }

        let plan = self.builder.build(&intent, &self.session.tool_catalog()).await;
        self.emit(ProgressEvent::PlanReady {
            summary: plan.summary.clone(),
            step_count: plan.steps.len(),
        });

        self.execute_plan(&plan, &token).await
    }

    async fn execute_plan(
        &self,
        plan: &Plan,
        token: &tokio_util::sync::CancellationToken,
    ) -> RunReport {
        let total = plan.steps.len();
        let mut results: Vec<String> = Vec::with_capacity(total);

        for (i, step) in plan.steps.iter().enumerate() {
            let index = i + 1;

            // 中断只在步骤边界生效
            if token.is_cancelled() {
                tracing::info!(completed = results.len(), "interrupted at step boundary");
                self.emit(ProgressEvent::Interrupted {
                    completed_steps: results.len(),
                });
                results.push(format!("已中断（完成 {}/{} 步）", i, total));
                return self.report(RunStatus::Cancelled, results);
            }

            self.emit(ProgressEvent::StepStarted {
                index,
                total,
                tool: step.tool.clone(),
                description: step.description.clone(),
            });

            // 客户端安全门：危险步骤在分发前走确认握手
            let verdict = self.classifier.classify(&step.tool, &step.args);
            if let Some(reason) = verdict.reason {
                let approved = match self.elicitation.request(&reason).await {
                    Ok(approved) => approved,
                    Err(e) => {
                        tracing::error!(error = %e, "elicitation invariant violated");
                        false
                    }
                };
                if !approved {
                    let err = AgentError::UserCancelled;
                    tracing::info!(step = index, error = %err, "user declined, plan cancelled");
                    return self.cancel(index, results);
                }
            }

            match self.dispatch_step(index, &step.tool, &step.args).await {
                Ok(summary) => {
                    let line = format!("步骤 {}: {}", index, summary);
                    self.emit(ProgressEvent::StepCompleted {
                        index,
                        summary: summary.clone(),
                    });
                    results.push(line);
                }
                Err(AgentError::UserCancelled) => {
                    tracing::info!(step = index, "endpoint reported user cancellation");
                    return self.cancel(index, results);
                }
                Err(e) => {
                    // partial-failure：记录失败，继续后续步骤
                    let reason = e.to_string();
                    tracing::warn!(step = index, reason = %reason, "step failed");
                    self.emit(ProgressEvent::StepFailed {
                        index,
                        reason: reason.clone(),
                    });
                    results.push(format!("步骤 {} 错误: {}", index, reason));
                }
            }
        }

        let report = self.report(RunStatus::Completed, results);
        self.emit(ProgressEvent::Completed {
            summary: report.summary.clone(),
        });
        report
    }

    /// 分发单步：传输错误按固定间隔重试；端点应答（含工具级错误与用户取消）
    /// 不重试。每次尝试输出一行 JSON 审计日志。
    async fn dispatch_step(
        &self,
        index: usize,
        tool: &str,
        args: &Value,
    ) -> Result<String, AgentError> {
        let preview = args_preview(args);
        let mut last_error = AgentError::ToolInvocation("未分发".to_string());
        for attempt in 1..=self.retry_attempts {
            let start = Instant::now();
            match self.session.invoke_tool(tool, args.clone()).await {
                Ok(result) => {
                    let normalized = normalize_result(&result);
                    let outcome = match &normalized {
                        Ok(_) => "ok",
                        Err(AgentError::UserCancelled) => "cancelled",
                        Err(AgentError::SandboxExecution(_)) => "sandbox_error",
                        Err(_) => "tool_error",
                    };
                    let audit = audit_line(tool, normalized.is_ok(), outcome, start, &preview);
                    tracing::info!(audit = %audit, "tool");
                    return normalized;
                }
                Err(e) => {
                    let audit = audit_line(tool, false, "transport_error", start, &preview);
                    tracing::info!(audit = %audit, "tool");
                    last_error = e;
                    if attempt < self.retry_attempts {
                        tracing::warn!(
                            step = index,
                            attempt,
                            error = %last_error,
                            "dispatch failed, retrying"
                        );
                        tokio::time::sleep(std::time::Duration::from_millis(self.retry_delay_ms))
                            .await;
                    }
                }
            }
        }
        Err(last_error)
    }

    /// 用户拒绝/端点取消的公共终态路径
    fn cancel(&self, index: usize, mut results: Vec<String>) -> RunReport {
        results.push("用户取消执行".to_string());
        self.emit(ProgressEvent::StepFailed {
            index,
            reason: "用户取消执行".to_string(),
        });
        self.report(RunStatus::Cancelled, results)
    }

    fn report(&self, status: RunStatus, results: Vec<String>) -> RunReport {
        let summary = if results.is_empty() {
            "（无执行结果）".to_string()
        } else {
            results.join("\n\n")
        };
        RunReport {
            status,
            summary,
            step_results: results,
        }
    }
}

/// 端点应答归一化为人类可读摘要
///
/// 支持两种惯用结构：`{success, result, error, path}` 与沙箱的
/// `{output, error}`（后者的错误映射为 SandboxExecution）；字符串应答先
/// 尝试按 JSON 再解一层。「用户取消执行」与「文件夹已存在」是两个语义
/// 特例：前者映射为 UserCancelled 终止计划，后者按成功处理。
fn normalize_result(result: &ToolCallResult) -> Result<String, AgentError> {
    if result.kind == ToolResultKind::ToolError {
        let text = result
            .payload
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| result.payload.to_string());
        return Err(AgentError::ToolInvocation(text));
    }
    normalize_payload(&result.payload)
}

fn normalize_payload(payload: &Value) -> Result<String, AgentError> {
    match payload {
        Value::Object(map) => {
            if map.contains_key("success") {
                let success = map.get("success").and_then(Value::as_bool).unwrap_or(false);
                let path = map.get("path").and_then(Value::as_str);
                if success {
                    let mut text = map
                        .get("result")
                        .and_then(Value::as_str)
                        .unwrap_or("执行成功！")
                        .to_string();
                    if let Some(p) = path {
                        text.push_str(&format!(" (路径: {})", p));
                    }
                    return Ok(text);
                }
                let error = map
                    .get("error")
                    .and_then(Value::as_str)
                    .unwrap_or("未知错误");
                if error.contains("用户取消执行") {
                    return Err(AgentError::UserCancelled);
                }
                // 目标已存在不算失败
                if error.contains("文件夹已存在") {
                    let mut text = "文件夹已存在".to_string();
                    if let Some(p) = path {
                        text.push_str(&format!(" (路径: {})", p));
                    }
                    return Ok(text);
                }
                return Err(AgentError::ToolInvocation(error.to_string()));
            }

            if map.contains_key("output") || map.contains_key("error") {
                let error = map.get("error").and_then(Value::as_str).unwrap_or("");
                if !error.is_empty() {
                    if error.contains("用户取消执行") {
                        return Err(AgentError::UserCancelled);
                    }
                    return Err(AgentError::SandboxExecution(error.to_string()));
                }
                let output = map.get("output").and_then(Value::as_str).unwrap_or("");
                if output.is_empty() {
                    return Ok("执行成功！".to_string());
                }
                return Ok(output.to_string());
            }

            Ok(Value::Object(map.clone()).to_string())
        }
        Value::String(s) => {
            if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                if parsed.is_object() {
                    return normalize_payload(&parsed);
                }
            }
            if s.contains("用户取消执行") {
                return Err(AgentError::UserCancelled);
            }
            if s.is_empty() {
                Ok("执行成功！".to_string())
            } else {
                Ok(s.clone())
            }
        }
        Value::Null => Ok("执行成功！".to_string()),
        other => Ok(other.to_string()),
    }
}

/// 单次分发的审计日志行（JSON）
fn audit_line(tool: &str, ok: bool, outcome: &str, start: Instant, preview: &str) -> Value {
    serde_json::json!({
        "event": "tool_audit",
        "tool": tool,
        "ok": ok,
        "outcome": outcome,
        "duration_ms": start.elapsed().as_millis() as u64,
        "args_preview": preview,
    })
}

/// 参数预览：序列化后截断到 200 字符，审计日志不放完整代码串
fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

/// 为编排器起一条命令消费循环；Submit 串行执行，Quit 关闭会话并退出。
/// 中断不走这条队列：前端直接调 session.interrupt()，否则排在运行中的
/// 请求后面就失去意义了。
pub fn spawn_command_loop(
    orchestrator: Arc<Orchestrator>,
    session: Arc<ExecutionSession>,
) -> mpsc::UnboundedSender<Command> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Submit(query) => {
                    let report = orchestrator.run(&query).await;
                    tracing::info!(status = ?report.status, "request finished");
                }
                Command::Quit => {
                    session.close().await;
                    break;
                }
            }
        }
    });
    tx
}
