use std::net::SocketAddr;
use std::sync::Arc;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{CorsLayer, Any};
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use consultation_queue_cell::{
    CacheStore, ConsultationQueueState, ConsultationStore, InMemoryCacheStore, InMemoryConsultationStore,
    RedisCacheStore, SupabaseConsultationStore,
};
use shared_config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting consultation queue API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());

    // Persistence: Supabase when configured, otherwise process memory
    let (store, supabase): (Arc<dyn ConsultationStore>, Option<Arc<SupabaseConsultationStore>>) =
        if config.is_configured() {
            let supabase = Arc::new(SupabaseConsultationStore::new(&config));
            (supabase.clone() as Arc<dyn ConsultationStore>, Some(supabase))
        } else {
            warn!("Supabase is not configured; consultations are kept in memory only");
            (Arc::new(InMemoryConsultationStore::new()) as Arc<dyn ConsultationStore>, None)
        };

    // Cache: Redis when reachable, otherwise process memory
    let cache: Arc<dyn CacheStore> = match config.redis_url.as_deref() {
        Some(url) => match RedisCacheStore::new(url).await {
            Ok(redis) => Arc::new(redis),
            Err(e) => {
                warn!("Redis unavailable ({}); using in-memory wait-time cache", e);
                Arc::new(InMemoryCacheStore::new())
            }
        },
        None => Arc::new(InMemoryCacheStore::new()),
    };

    let state = ConsultationQueueState::new(config.clone(), store, cache).await?;

    if let Some(supabase) = supabase {
        let synced = state.sync_presence(supabase.as_ref()).await;
        info!("Loaded presence for {} professionals", synced);
    }

    let watchdog = Arc::new(state.watchdog());
    watchdog.spawn();

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
