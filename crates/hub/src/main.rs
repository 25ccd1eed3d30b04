mod bridge;
mod clock;
mod commands;
mod config;
mod db;
mod events;
mod hub;
mod ingest;
mod mqtt;
mod reconciler;
mod state;
mod stats;
mod web;

use anyhow::Result;
use rumqttc::AsyncClient;
use std::{env, sync::Arc};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use bridge::{AckLanes, BrokerHandle, Dispatcher, MqttSettings, SensorLane, DEFAULT_ACK_LANES};
use clock::Calendar;
use commands::{CommandPublisher, PendingCommands};
use db::Db;
use events::Broadcaster;
use hub::Hub;
use ingest::Ingestor;
use reconciler::Reconciler;
use state::HubState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:iot-hub.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let web_port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    // ── Config file + calendar ──────────────────────────────────────
    let cfg = config::load(&config_path)?;
    let calendar = Calendar::system(cfg.calendar_zone()?);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;
    config::apply(&cfg, &db, calendar.today()).await?;

    let devices = db.list_devices().await?;
    if devices.is_empty() {
        warn!("no devices configured; ACKs will be discarded until devices exist");
    }
    info!(devices = devices.len(), today = %calendar.today(), "db ready");

    // ── Shared state + fan-out ──────────────────────────────────────
    let shared = HubState::shared();
    shared.write().await.record_system("hub started".to_string());
    let bus = Broadcaster::default();
    let pending = Arc::new(PendingCommands::new(cfg.pending_command_ttl_sec));

    // ── MQTT ────────────────────────────────────────────────────────
    let settings = MqttSettings::from_env();
    info!(host = %settings.host, port = settings.port, client_id = %settings.client_id, "mqtt settings");
    let (client, eventloop) = AsyncClient::new(settings.options(), 64);

    let reconciler = Arc::new(Reconciler::new(
        db.clone(),
        bus.clone(),
        calendar.clone(),
        Arc::clone(&pending),
        Arc::clone(&shared),
    ));
    let ingestor = Ingestor::new(db.clone(), bus.clone(), calendar.clone(), Arc::clone(&shared));
    let dispatcher = Dispatcher::new(
        cfg.topics.clone(),
        SensorLane::spawn(ingestor),
        AckLanes::spawn(DEFAULT_ACK_LANES, reconciler),
        Arc::clone(&shared),
    );

    let commands = CommandPublisher::new(
        db.clone(),
        BrokerHandle::new(client.clone()),
        cfg.topics.commands.clone(),
        pending,
        calendar.clone(),
        Arc::clone(&shared),
    );
    let hub = Arc::new(Hub::new(db, calendar, bus, shared, commands));
    hub.seed_today_stats().await?;

    // ── Run ─────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let web = tokio::spawn(web::serve(Arc::clone(&hub), web_port, shutdown_rx.clone()));
    let bridge = tokio::spawn(bridge::run(eventloop, client, dispatcher, shutdown_rx));

    info!(
        sensors = %cfg.topics.sensors,
        acks = %cfg.topics.acks,
        commands = %cfg.topics.commands,
        "hub running"
    );

    shutdown_signal().await;
    shutdown_tx.send(true).ok();

    if let Err(e) = bridge.await {
        error!("bridge task failed: {e}");
    }
    match web.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("{e:#}"),
        Err(e) => error!("web task failed: {e}"),
    }
    info!("hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
