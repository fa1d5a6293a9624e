mod api;

use badseed_core::{
    candles::CandleService,
    memory_store::MemoryStore,
    native::{NativeHttpClient, NativeRpcClient, UpstashStore},
    price_source::JupiterPriceSource,
    query::QueryService,
    reconciler::Reconciler,
    ChainReader, CoreError, HttpClient, KvStore, ReconcilerHandle, Settings,
};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

type AppError = CoreError;

const RECONCILER_QUEUE: usize = 64;

fn build_store(settings: &Settings, timeout: Duration) -> Result<Arc<dyn KvStore>, AppError> {
    let url = settings.store_url.as_deref().filter(|s| !s.trim().is_empty());
    let token = settings.store_token.as_deref().filter(|s| !s.trim().is_empty());
    match (url, token) {
        (Some(url), Some(token)) => {
            info!("Using REST key-value store at {}", url);
            Ok(Arc::new(UpstashStore::new(url, token, timeout)?))
        }
        _ => {
            warn!("store_url/store_token not set; state is kept in memory and lost on restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn spawn_interval<F, Fut>(name: &'static str, every_secs: u64, run: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    if every_secs == 0 {
        info!("{} schedule disabled", name);
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(every_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            run().await;
        }
    });
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    env_logger::init();

    let config_path = std::env::var("BADSEED_CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let settings = Arc::new(Settings::load(&config_path)?);
    settings.validate()?;
    info!("Tracking {} ({}) mint {}", settings.name, settings.symbol, settings.mint);

    let timeout = Duration::from_secs(settings.http_timeout_secs);
    let store = build_store(&settings, timeout)?;
    let chain: Arc<dyn ChainReader> = Arc::new(NativeRpcClient::new(
        settings.primary_rpc_url(),
        settings.fallback_rpc_url.clone(),
        timeout,
    ));
    let http: Arc<dyn HttpClient> = Arc::new(NativeHttpClient::new(timeout)?);
    let prices = Arc::new(JupiterPriceSource::new(http.clone(), settings.jupiter_price_url.clone()));

    let creator = settings.creator_keypair()?.map(Arc::new);
    if creator.is_none() {
        warn!("creator_secret_key not set; auto-forwarding is disabled");
    }

    let reconciler = Reconciler::new(settings.clone(), chain, store.clone(), prices, creator);
    let (handle, reconciler_task) = ReconcilerHandle::spawn(reconciler, RECONCILER_QUEUE);

    // One-shot mode for external schedulers: run both jobs and exit.
    if std::env::args().any(|a| a == "--once") {
        match handle.poll().await {
            Ok(out) => info!("Poll: {}", serde_json::to_string(&out)?),
            Err(e) => error!("Poll failed: {}", e),
        }
        match handle.sweep().await {
            Ok(out) => info!("Sweep: {}", serde_json::to_string(&out)?),
            Err(e) => error!("Sweep failed: {}", e),
        }
        drop(handle);
        if let Err(e) = reconciler_task.await {
            error!("Reconciler task ended abnormally: {}", e);
        }
        return Ok(());
    }

    let poll_handle = handle.clone();
    spawn_interval("Poll", settings.poll_interval_secs, move || {
        let handle = poll_handle.clone();
        async move {
            match handle.poll().await {
                Ok(out) => info!(
                    "Poll: mode={} price={:.10} SOL mcap={:.2} SOL progress={:.2}%",
                    out.mode, out.price_sol, out.market_cap_sol, out.curve_progress
                ),
                Err(e) => error!("Poll failed: {}", e),
            }
        }
    });

    let sweep_handle = handle.clone();
    spawn_interval("Sweep", settings.sweep_interval_secs, move || {
        let handle = sweep_handle.clone();
        async move {
            match handle.sweep().await {
                Ok(out) => info!(
                    "Sweep: detected={} SOL forwarded={} SOL total={} SOL",
                    out.total_new_sol, out.forwarded_sol, out.total_donated_sol
                ),
                Err(e) => error!("Sweep failed: {}", e),
            }
        }
    });

    let state = api::ApiState {
        settings: settings.clone(),
        reconciler: handle,
        query: Arc::new(QueryService::new(settings.clone(), store.clone())),
        candles: Arc::new(CandleService::new(settings.clone(), store, http)),
    };
    let app = api::create_router(state);

    let bind_addr = format!("{}:{}", settings.api_host, settings.api_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("API server listening on http://{}", bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
