//! 执行管线集成测试
//!
//! 用脚本化 LLM 与脚本化工具端点驱动完整管线：意图 → 计划 → 安全门 →
//! 确认握手 → 分发重试 → 结果归一化，覆盖部分失败、用户拒绝、端点侧
//! 取消与步骤边界中断。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use mantis::config::AppConfig;
use mantis::core::{Orchestrator, ProgressEvent, RunStatus};
use mantis::elicitation::ElicitationCoordinator;
use mantis::llm::MockLlmClient;
use mantis::sandbox::SandboxExecutor;
use mantis::security::SecurityClassifier;
use mantis::session::{
    ConfirmHandler, ContentItem, ExecutionSession, LocalEndpoint, ToolDescriptor, ToolTransport,
};

/// 脚本化端点：按序弹出预置应答，记录所有调用
struct MockTransport {
    calls: Mutex<Vec<(String, Value)>>,
    script: Mutex<VecDeque<Result<Value, String>>>,
    /// 第 N 次调用完成后中断会话（模拟运行中用户按下 stop）
    interrupt_after_call: Option<usize>,
    session: Mutex<Option<Arc<ExecutionSession>>>,
}

impl MockTransport {
    fn new(script: Vec<Result<Value, String>>) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            script: Mutex::new(script.into_iter().collect()),
            interrupt_after_call: None,
            session: Mutex::new(None),
        }
    }

    fn interrupting_after(mut self, call: usize) -> Self {
        self.interrupt_after_call = Some(call);
        self
    }

    fn attach_session(&self, session: Arc<ExecutionSession>) {
        *self.session.lock().unwrap() = Some(session);
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn called_tools(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(t, _)| t.clone()).collect()
    }
}

#[async_trait]
impl ToolTransport for MockTransport {
    async fn open(&self) -> Result<(), String> {
        Ok(())
    }

    async fn shutdown(&self) {}

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, String> {
        Ok(vec![
            ToolDescriptor {
                name: "execute_python".to_string(),
                description: "执行 Python 代码".to_string(),
                parameters: json!({"type": "object", "properties": {"code": {"type": "string"}}, "required": ["code"]}),
            },
            ToolDescriptor {
                name: "file_operations".to_string(),
                description: "文件操作".to_string(),
                parameters: json!({"type": "object", "properties": {"operation": {"type": "string"}, "path": {"type": "string"}}, "required": ["operation", "path"]}),
            },
        ])
    }

    async fn call_tool(
        &self,
        name: &str,
        args: Value,
        _confirm: Option<ConfirmHandler>,
    ) -> Result<Vec<ContentItem>, String> {
        let count = {
            let mut calls = self.calls.lock().unwrap();
            calls.push((name.to_string(), args));
            calls.len()
        };
        if self.interrupt_after_call == Some(count) {
            if let Some(session) = self.session.lock().unwrap().as_ref() {
                session.interrupt();
            }
        }
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Ok(v)) => Ok(vec![ContentItem::json(&v)]),
            Some(Err(e)) => Err(e),
            None => Ok(vec![ContentItem::json(&json!({"success": true, "result": "ok"}))]),
        }
    }
}

fn test_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.client.retry_delay_ms = 1; // 测试不等真实重试间隔
    cfg.client.elicitation_timeout_secs = 5;
    cfg
}

fn intent_task() -> &'static str {
    r#"{"intent": "task", "entities": {}, "confidence": 0.9}"#
}

/// 搭一套完整管线：脚本化 LLM + 给定端点
fn pipeline(
    transport: Arc<dyn ToolTransport>,
    llm_script: Vec<&str>,
) -> (
    Orchestrator,
    Arc<ExecutionSession>,
    Arc<ElicitationCoordinator>,
    mpsc::UnboundedReceiver<ProgressEvent>,
) {
    let cfg = test_config();
    let session = Arc::new(ExecutionSession::new(transport));
    let coordinator = Arc::new(ElicitationCoordinator::new(
        cfg.client.elicitation_timeout_secs,
    ));
    let llm = Arc::new(MockLlmClient::scripted(llm_script));
    let mut orchestrator = Orchestrator::new(
        session.clone(),
        llm,
        SecurityClassifier::new(cfg.security.dangerous_commands.clone()),
        coordinator.clone(),
        &cfg,
    );
    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator.set_event_sender(tx);
    (orchestrator, session, coordinator, rx)
}

#[tokio::test]
async fn plan_steps_execute_in_order() {
    let transport = Arc::new(MockTransport::new(vec![
        Ok(json!({"success": true, "result": "文件创建成功", "path": "/tmp/a.txt"})),
        Ok(json!({"success": true, "result": "文件创建成功", "path": "/tmp/b.txt"})),
    ]));
    let plan = r#"{"plan": "创建两个文件", "steps": [
        {"tool": "file_operations", "args": {"operation": "create", "path": "a.txt"}, "description": "创建 a.txt"},
        {"tool": "file_operations", "args": {"operation": "create", "path": "b.txt"}, "description": "创建 b.txt"}
    ]}"#;
    let (orch, _session, _coord, _rx) =
        pipeline(transport.clone(), vec![intent_task(), plan]);

    let report = orch.run("创建 a.txt 和 b.txt").await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.step_results.len(), 2);
    assert!(report.step_results[0].contains("文件创建成功 (路径: /tmp/a.txt)"));
    assert!(report.step_results[1].contains("/tmp/b.txt"));
    assert_eq!(transport.called_tools(), vec!["file_operations", "file_operations"]);
}

#[tokio::test]
async fn flagged_step_not_dispatched_when_declined() {
    let transport = Arc::new(MockTransport::new(vec![]));
    let plan = r#"{"plan": "执行代码", "steps": [
        {"tool": "execute_python", "args": {"code": "eval('1+1')"}, "description": "危险代码"}
    ]}"#;
    let (orch, _session, coord, mut rx) = pipeline(transport.clone(), vec![intent_task(), plan]);

    // 收到确认请求后拒绝
    let c = coord.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if matches!(event, ProgressEvent::ElicitationRequested { .. }) {
                c.resolve(false);
                break;
            }
        }
    });

    let report = orch.run("跑一段代码").await;

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(report.summary.contains("用户取消执行"));
    // 未经批准，分发根本没有发生
    assert_eq!(transport.call_count(), 0);
}

#[tokio::test]
async fn flagged_step_dispatched_after_approval() {
    let transport = Arc::new(MockTransport::new(vec![Ok(
        json!({"output": "2\n", "error": ""}),
    )]));
    let plan = r#"{"plan": "执行代码", "steps": [
        {"tool": "execute_python", "args": {"code": "eval('1+1')"}, "description": "危险代码"}
    ]}"#;
    let (orch, _session, coord, mut rx) = pipeline(transport.clone(), vec![intent_task(), plan]);

    let c = coord.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if matches!(event, ProgressEvent::ElicitationRequested { .. }) {
                c.resolve(true);
                break;
            }
        }
    });

    let report = orch.run("跑一段代码").await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(transport.call_count(), 1);
    assert!(report.summary.contains("2"));
}

#[tokio::test]
async fn transient_dispatch_failures_are_retried() {
    let transport = Arc::new(MockTransport::new(vec![
        Err("connection reset".to_string()),
        Err("connection reset".to_string()),
        Ok(json!({"success": true, "result": "终于成功"})),
    ]));
    let plan = r#"{"plan": "一步", "steps": [
        {"tool": "file_operations", "args": {"operation": "list", "path": "."}, "description": "列目录"}
    ]}"#;
    let (orch, _session, _coord, _rx) = pipeline(transport.clone(), vec![intent_task(), plan]);

    let report = orch.run("列一下目录").await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(transport.call_count(), 3); // 两次失败 + 一次成功
    assert!(report.summary.contains("终于成功"));
}

#[tokio::test]
async fn exhausted_retries_record_failure_and_continue() {
    let transport = Arc::new(MockTransport::new(vec![
        Err("boom".to_string()),
        Err("boom".to_string()),
        Err("boom".to_string()),
        Ok(json!({"success": true, "result": "第二步成功"})),
    ]));
    let plan = r#"{"plan": "两步", "steps": [
        {"tool": "file_operations", "args": {"operation": "read", "path": "a"}, "description": "读 a"},
        {"tool": "file_operations", "args": {"operation": "read", "path": "b"}, "description": "读 b"}
    ]}"#;
    let (orch, _session, _coord, _rx) = pipeline(transport.clone(), vec![intent_task(), plan]);

    let report = orch.run("读两个文件").await;

    // 第一步耗尽重试后记为失败，第二步仍然执行
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.step_results.len(), 2);
    assert!(report.step_results[0].starts_with("步骤 1 错误:"));
    assert!(report.step_results[1].contains("第二步成功"));
    assert_eq!(transport.call_count(), 4);
}

#[tokio::test]
async fn endpoint_cancellation_is_terminal_and_not_retried() {
    let transport = Arc::new(MockTransport::new(vec![Ok(
        json!({"success": false, "error": "用户取消执行"}),
    )]));
    let plan = r#"{"plan": "两步", "steps": [
        {"tool": "file_operations", "args": {"operation": "delete", "path": "a"}, "description": "删 a"},
        {"tool": "file_operations", "args": {"operation": "read", "path": "b"}, "description": "读 b"}
    ]}"#;
    let (orch, _session, _coord, _rx) = pipeline(transport.clone(), vec![intent_task(), plan]);

    let report = orch.run("删掉再读").await;

    assert_eq!(report.status, RunStatus::Cancelled);
    // 取消既不重试当前步骤，也不执行后续步骤
    assert_eq!(transport.call_count(), 1);
}

#[tokio::test]
async fn interrupt_takes_effect_at_step_boundary() {
    let transport = Arc::new(
        MockTransport::new(vec![
            Ok(json!({"success": true, "result": "第一步成功"})),
            Ok(json!({"success": true, "result": "不该执行到这"})),
        ])
        .interrupting_after(1),
    );
    let plan = r#"{"plan": "三步", "steps": [
        {"tool": "file_operations", "args": {"operation": "read", "path": "a"}, "description": "读 a"},
        {"tool": "file_operations", "args": {"operation": "read", "path": "b"}, "description": "读 b"},
        {"tool": "file_operations", "args": {"operation": "read", "path": "c"}, "description": "读 c"}
    ]}"#;
    let (orch, session, _coord, _rx) = pipeline(transport.clone(), vec![intent_task(), plan]);
    transport.attach_session(session);

    let report = orch.run("读三个文件").await;

    assert_eq!(report.status, RunStatus::Cancelled);
    // 第一步完成，第二步的边界检查拦下了后续执行
    assert_eq!(transport.call_count(), 1);
    assert!(report.step_results[0].contains("第一步成功"));
    assert!(report.summary.contains("已中断"));
}

#[tokio::test]
async fn code_intent_runs_single_python_step() {
    let transport = Arc::new(MockTransport::new(vec![Ok(
        json!({"output": "4\n", "error": ""}),
    )]));
    // 意图低置信度 → 降级为 code → 第二条应答是生成的代码
    let (orch, _session, _coord, _rx) = pipeline(
        transport.clone(),
        vec![
            r#"{"intent": "task", "entities": {}, "confidence": 0.2}"#,
            "print(2 + 2)",
        ],
    );

    let report = orch.run("帮我算 2+2").await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(transport.called_tools(), vec!["execute_python"]);
    assert!(report.summary.contains("4"));
}

#[tokio::test]
async fn local_endpoint_file_create_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = test_config();
    let endpoint = LocalEndpoint::new(
        SecurityClassifier::new(cfg.security.dangerous_commands.clone()),
        SandboxExecutor::new(&cfg.sandbox.interpreter),
        cfg.client.timeout_secs,
    )
    .with_root(dir.path());

    let plan = r#"{"plan": "创建测试文件", "steps": [
        {"tool": "file_operations", "args": {"operation": "create", "path": "报告.txt", "content": "内容"}, "description": "创建报告"}
    ]}"#;
    let (orch, _session, _coord, _rx) = pipeline(Arc::new(endpoint), vec![intent_task(), plan]);

    let report = orch.run("创建一个报告文件").await;

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.summary.contains("文件创建成功 (路径: "));
    assert!(dir.path().join("报告.txt").exists());
}
