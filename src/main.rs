//! AnaBot Webhook 服务
//!
//! 入口：加载 .env 与配置、初始化日志，组装节点图 / Hook / 会话存储 / 引擎，
//! 启动 WhatsApp 与 Telegram Webhook 路由和不活跃会话巡检，直到收到 Ctrl+C / SIGTERM。
//!
//! 运行方式：
//! ```bash
//! cargo run --bin anabot -- [config.toml]
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anabot::clinic::{ClinicDb, Clock, SlotRules};
use anabot::config::{load_config, AppConfig};
use anabot::core::{run_with_graceful_shutdown, InactivityMonitor, ShutdownManager};
use anabot::flow::{load_or_safety, EngineSettings, FlowEngine};
use anabot::hooks::build_registry;
use anabot::integrations::idempotency::DEFAULT_CAPACITY;
use anabot::integrations::{MessageHub, ProcessedEvents, Senders};
use anabot::session::create_session_store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    anabot::observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let cfg = match load_config(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to load configuration, using defaults");
            AppConfig::default()
        }
    };

    let rules = SlotRules::from(&cfg.scheduling);
    let clock = Clock::system(rules.offset);

    let db = match &cfg.app.database_path {
        Some(path) => ClinicDb::open(path)
            .with_context(|| format!("Failed to open clinic database {}", path.display()))?,
        None => {
            tracing::warn!("No clinic database configured, using an in-memory database");
            ClinicDb::open_in_memory().context("Failed to create in-memory clinic database")?
        }
    };
    let db = Arc::new(db);

    let graph = Arc::new(load_or_safety(&cfg.flow.path, &cfg.flow.default_start));
    if graph.is_degraded() {
        tracing::error!(path = %cfg.flow.path.display(), "Serving the safety flow until the node graph is fixed");
    }
    let hooks = Arc::new(build_registry(clock.clone(), rules, Some(db.clone())));
    let store = create_session_store(cfg.session.db_path.as_deref());
    let engine = Arc::new(FlowEngine::new(
        graph,
        hooks,
        store,
        EngineSettings::from(&cfg.flow),
        clock,
    ));

    #[allow(unused_mut)]
    let mut senders = Senders::new(Some(db.clone()));

    #[cfg(feature = "whatsapp")]
    {
        match anabot::integrations::whatsapp::WhatsappClient::from_config(&cfg.whatsapp) {
            Some(client) => senders.register(Arc::new(client)),
            None => tracing::warn!("WhatsApp credentials missing, replies on this channel are disabled"),
        }
    }

    #[cfg(feature = "telegram")]
    let telegram_client = anabot::integrations::telegram::TelegramClient::from_config(&cfg.telegram).map(Arc::new);
    #[cfg(feature = "telegram")]
    {
        match &telegram_client {
            Some(client) => senders.register(client.clone()),
            None => tracing::warn!("Telegram bot token missing, replies on this channel are disabled"),
        }
    }

    let senders = Arc::new(senders);
    let events = Arc::new(ProcessedEvents::new(DEFAULT_CAPACITY, Some(db.clone())));
    let hub = Arc::new(MessageHub::new(engine.clone(), senders.clone(), events, Some(db)));

    let shutdown = Arc::new(ShutdownManager::new());
    if cfg.inactivity.enabled {
        let monitor = InactivityMonitor::new(engine.clone(), senders.clone(), cfg.inactivity.clone());
        tokio::spawn(monitor.run(shutdown.token()));
    }

    #[cfg(any(feature = "whatsapp", feature = "telegram"))]
    {
        #[allow(unused_mut)]
        let mut router = anabot::integrations::health_router();

        #[cfg(feature = "whatsapp")]
        {
            use anabot::integrations::whatsapp::{create_router, WhatsappState};
            router = router.merge(create_router(Arc::new(WhatsappState {
                hub: hub.clone(),
                verify_token: cfg.whatsapp.verify_token.clone(),
            })));
        }

        #[cfg(feature = "telegram")]
        {
            use anabot::integrations::telegram::{create_router, TelegramState};
            router = router.merge(create_router(Arc::new(TelegramState {
                hub: hub.clone(),
                webhook_secret: cfg.telegram.webhook_secret.clone(),
                client: telegram_client.clone(),
            })));
        }

        let listener = tokio::net::TcpListener::bind(&cfg.app.bind)
            .await
            .with_context(|| format!("Failed to bind {}", cfg.app.bind))?;
        tracing::info!(name = %cfg.app.name, bind = %cfg.app.bind, "AnaBot listening");

        let token = shutdown.token();
        let server = async move {
            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                tracing::error!(error = %e, "HTTP server stopped with an error");
            }
        };
        run_with_graceful_shutdown(shutdown.clone(), server, || async {
            tracing::info!("AnaBot stopped");
        })
        .await;
    }

    #[cfg(not(any(feature = "whatsapp", feature = "telegram")))]
    {
        let _ = hub;
        tracing::warn!("Built without channel features, only the inactivity monitor is running");
        run_with_graceful_shutdown(shutdown.clone(), std::future::pending::<()>(), || async {
            tracing::info!("AnaBot stopped");
        })
        .await;
    }

    Ok(())
}
