//! Mantis - Rust 智能桌面执行网关
//!
//! 入口：初始化日志与配置，按配置选择工具端点（进程内 / HTTP），
//! 搭好会话、确认协调器与编排器，然后跑一个行式 REPL。
//! 请求在后台串行执行，stdin 始终可用：待确认时输入 y/n 应答，
//! 运行中输入 stop 可在步骤边界中断。

use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use mantis::config::{load_config, AppConfig};
use mantis::core::{create_llm_from_config, spawn_command_loop, Command, Orchestrator, ProgressEvent};
use mantis::elicitation::ElicitationCoordinator;
use mantis::sandbox::SandboxExecutor;
use mantis::security::SecurityClassifier;
use mantis::session::{
    ConfirmHandler, ExecutionSession, HttpTransport, LocalEndpoint, ToolTransport,
};

fn build_transport(
    cfg: &AppConfig,
    output_tx: mpsc::UnboundedSender<String>,
) -> Arc<dyn ToolTransport> {
    match cfg.server.endpoint.as_str() {
        "http" => {
            tracing::info!(url = %cfg.server.url(), "using HTTP endpoint");
            Arc::new(HttpTransport::new(cfg.server.url(), cfg.client.timeout_secs))
        }
        _ => {
            tracing::info!("using in-process endpoint");
            Arc::new(
                LocalEndpoint::new(
                    SecurityClassifier::new(cfg.security.dangerous_commands.clone()),
                    SandboxExecutor::new(&cfg.sandbox.interpreter),
                    cfg.client.timeout_secs,
                )
                .with_root("workspace")
                .with_output(output_tx),
            )
        }
    }
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::ResolvingIntent { .. } => println!("正在解析意图…"),
        ProgressEvent::IntentResolved { kind, confidence } => {
            println!("意图: {} (置信度 {:.2})", kind, confidence)
        }
        ProgressEvent::PlanReady { summary, step_count } => {
            println!("计划: {} ({} 步)", summary, step_count)
        }
        ProgressEvent::StepStarted {
            index,
            total,
            description,
            ..
        } => println!("[{}/{}] {}", index, total, description),
        ProgressEvent::StepCompleted { summary, .. } => println!("  ✓ {}", summary),
        ProgressEvent::StepFailed { reason, .. } => println!("  ✗ {}", reason),
        ProgressEvent::ElicitationRequested { message } => {
            println!("⚠ {} [y/N]", message)
        }
        ProgressEvent::OutputChunk { text } => println!("  | {}", text),
        ProgressEvent::Interrupted { completed_steps } => {
            println!("已中断（完成 {} 步）", completed_steps)
        }
        ProgressEvent::Completed { summary } => println!("\n{}\n", summary),
        ProgressEvent::Error { text } => println!("错误: {}", text),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mantis::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });
    let _ = std::fs::create_dir_all("workspace");

    // 沙箱流式输出转成 OutputChunk 事件
    let (output_tx, mut output_rx) = mpsc::unbounded_channel::<String>();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    {
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = output_rx.recv().await {
                let _ = event_tx.send(ProgressEvent::OutputChunk { text: line });
            }
        });
    }

    let transport = build_transport(&cfg, output_tx);
    let session = Arc::new(ExecutionSession::new(transport));
    let coordinator = Arc::new(ElicitationCoordinator::new(
        cfg.client.elicitation_timeout_secs,
    ));

    // 端点侧的确认请求也走同一个协调器
    let confirm: ConfirmHandler = {
        let coordinator = coordinator.clone();
        Arc::new(move |message: String| {
            let coordinator = coordinator.clone();
            Box::pin(async move { coordinator.request(&message).await.unwrap_or(false) })
        })
    };
    session.set_confirm_handler(confirm);

    let llm = create_llm_from_config(&cfg);
    let mut orchestrator = Orchestrator::new(
        session.clone(),
        llm,
        SecurityClassifier::new(cfg.security.dangerous_commands.clone()),
        coordinator.clone(),
        &cfg,
    );
    orchestrator.set_event_sender(event_tx);

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            print_event(&event);
        }
    });

    let cmd_tx = spawn_command_loop(Arc::new(orchestrator), session.clone());

    println!("Mantis 桌面执行网关（输入任务描述；stop 中断；exit 退出）");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("stdin read failed")? {
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        // 待确认时，本行输入是对确认请求的应答
        if coordinator.has_pending() {
            let approved = matches!(input.to_lowercase().as_str(), "y" | "yes" | "是");
            coordinator.resolve(approved);
            continue;
        }

        match input {
            "exit" | "quit" => {
                let _ = cmd_tx.send(Command::Quit);
                break;
            }
            "stop" | "中断" => session.interrupt(),
            query => {
                let _ = cmd_tx.send(Command::Submit(query.to_string()));
            }
        }
    }

    Ok(())
}
