//! AnaBot 控制台
//!
//! 在终端里逐条输入消息驱动对话引擎，用于编写和调试节点图。会话保存在内存中，
//! 诊所 Hook 使用内存数据库（退出即丢失）。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin anabot-console -- config/flow.json
//! ```
//!
//! 控制命令：`:hooks` 列出 Hook，`:ctx` 打印上下文，`:session` 打印会话，`:reset` 新开会话，`:quit` 退出。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anabot::clinic::{ClinicDb, Clock, SlotRules};
use anabot::config::{load_config, AppConfig};
use anabot::flow::{load_path, EngineSettings, FlowEngine};
use anabot::hooks::build_registry;
use anabot::session::{MemorySessionStore, SessionStore};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    anabot::observability::init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Failed to load configuration, using defaults");
        AppConfig::default()
    });
    let flow_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| cfg.flow.path.clone());

    let graph = load_path(&flow_path, &cfg.flow.default_start)
        .with_context(|| format!("Failed to load node graph {}", flow_path.display()))?;
    for (from, to) in graph.dangling_targets() {
        println!("⚠️  {} -> {} (nodo inexistente)", from, to);
    }

    let rules = SlotRules::from(&cfg.scheduling);
    let clock = Clock::system(rules.offset);
    let db = Arc::new(ClinicDb::open_in_memory().context("Failed to create in-memory clinic database")?);
    let hooks = Arc::new(build_registry(clock.clone(), rules, Some(db)));
    let engine = FlowEngine::new(
        Arc::new(graph),
        hooks,
        Arc::new(MemorySessionStore::new()),
        EngineSettings::from(&cfg.flow),
        clock,
    );

    println!(
        "AnaBot console · {} nodos · inicio: {}",
        engine.graph().len(),
        engine.graph().start()
    );
    println!("Escribe un mensaje (:quit para salir)\n");

    let mut conversation = 1u32;
    let mut session_id = format!("console:{}", conversation);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };

        match line.trim() {
            ":quit" | ":q" => break,
            ":hooks" => {
                for (name, description) in engine.hooks().hook_descriptions() {
                    println!("  {:<32} {}", name, description);
                }
            }
            ":ctx" => {
                let session = engine.store().get(&session_id).await?;
                println!("{}", serde_json::to_string_pretty(&session.context)?);
            }
            ":session" => {
                let session = engine.store().get(&session_id).await?;
                println!("{}", serde_json::to_string_pretty(&session)?);
            }
            ":reset" => {
                conversation += 1;
                session_id = format!("console:{}", conversation);
                println!("(nueva sesión {})", session_id);
            }
            text => {
                let reply = engine.process_or_fallback(&session_id, text).await;
                println!("\n[{}]\n{}\n", reply.node, reply.message);
            }
        }
    }

    Ok(())
}
