mod cache;
mod config;
mod data;
mod dispatcher;
mod error;
mod http;
mod logging;
mod probe;
mod selector;
mod state;
mod whitelist;

use anyhow::Result;
use config::Config;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use reqwest::Client;
use std::{env, path::PathBuf, sync::Arc};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use state::AppState;
use whitelist::Whitelist;

static DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[tokio::main]
async fn main() -> Result<()> {
    let cfg_path = env::var("RPC_GATEWAY_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let cfg_path = PathBuf::from(cfg_path);
    let cfg = Config::load_from_path(&cfg_path)?;

    logging::init(cfg.log_level);
    info!("loaded config from {}", cfg_path.display());

    let whitelist = load_whitelist(&cfg, &cfg_path)?;
    info!(chains = whitelist.chain_ids().len(), "loaded whitelist");

    let client = Client::builder()
        .pool_max_idle_per_host(32)
        .tcp_keepalive(Some(std::time::Duration::from_secs(30)))
        .build()?;

    let app_state = Arc::new(AppState::new(cfg, whitelist, client.clone()));

    {
        let app_state = app_state.clone();
        let cfg_path = cfg_path.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = watch_config_and_apply(cfg_path, app_state, client).await {
                error!("config watcher error: {:?}", e);
            }
        });
    }

    let addr = {
        let cfg = app_state.cfg.read().await;
        format!("{}:{}", cfg.server.bind_addr, cfg.server.port).parse()?
    };

    let shutdown = app_state.shutdown_token();
    let router = http::router(app_state);
    info!("listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(wait_for_shutdown_signal(shutdown))
        .await?;
    Ok(())
}

/// Waits for Ctrl-C, then cancels `shutdown`. Every outstanding request's
/// child token (`AppState::request_cancellation`) observes the cancellation
/// and aborts its current dispatch attempt, and `axum::serve` stops
/// accepting new connections once this future resolves. This is
/// process-wide graceful shutdown, not per-client disconnect detection —
/// a client that simply closes its socket mid-request is already handled
/// for free by axum/hyper dropping the handler future, with no token
/// involved.
async fn wait_for_shutdown_signal(shutdown: tokio_util::sync::CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install ctrl-c handler; shutdown will only occur if the listener is closed externally");
        return;
    }
    info!("received shutdown signal, cancelling outstanding requests");
    shutdown.cancel();
}

fn load_whitelist(cfg: &Config, cfg_path: &PathBuf) -> Result<Whitelist> {
    if let Some(inline) = cfg.initial_rpc_data.clone() {
        return Ok(Whitelist::from_source(inline));
    }
    let path = state::resolve_whitelist_path(cfg, cfg_path)
        .ok_or_else(|| anyhow::anyhow!("no whitelist_path or initial_rpc_data configured"))?;
    Whitelist::load_from_path(&path)
}

async fn watch_config_and_apply(cfg_path: PathBuf, app: Arc<AppState>, client: Client) -> Result<()> {
    use tokio::sync::mpsc;
    let (tx, mut rx) = mpsc::channel::<()>(8);

    let mut watcher: RecommendedWatcher = Watcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(ev) = res {
                match ev.kind {
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {
                        let _ = tx.try_send(());
                    }
                    _ => {}
                }
            }
        },
        notify::Config::default(),
    )?;

    let watch_dir = cfg_path.parent().unwrap_or_else(|| std::path::Path::new("."));
    watcher.watch(watch_dir, RecursiveMode::NonRecursive)?;

    loop {
        rx.recv().await;
        let new_cfg = match Config::load_from_path(&cfg_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("failed to reload config: {:?}", e);
                continue;
            }
        };
        match load_whitelist(&new_cfg, &cfg_path) {
            Ok(whitelist) => {
                *app.cfg.write().await = new_cfg;
                app.reload_whitelist(whitelist, client.clone()).await;
                info!("applied new config and whitelist (hot reload)");
            }
            Err(e) => error!("failed to reload whitelist: {:?}", e),
        }
    }
}
