//! Teranga API Server
//!
//! Serves listing publication, quota reporting, provider webhooks and the
//! admin pricing console on top of the monetization engine.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use teranga_api::{config::Config, routes::create_router, state::AppState};
use teranga_monetization::{
    CacheInvalidator, Clock, InvariantChecker, MemoryStore, MonetizationStore,
    NoopCacheInvalidator, PgStore, PricingConfig, RedisCacheInvalidator, SystemClock,
};
use teranga_shared::{create_migration_pool, create_pool, init_tracing, run_migrations};
use time::Duration;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

/// Launch window used by the in-memory development store
const DEV_LAUNCH_PERIOD: Duration = Duration::days(90);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing("info,teranga_api=debug,teranga_monetization=debug");

    tracing::info!("Starting Teranga API Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!(config = ?config, "Configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let (store, invariants): (Arc<dyn MonetizationStore>, Option<InvariantChecker>) =
        match &config.database_url {
            Some(database_url) => {
                tracing::info!("Connecting to database...");
                let pool = create_pool(database_url).await?;
                tracing::info!("Database connection established");

                if config.run_migrations {
                    let migration_pool = create_migration_pool(database_url).await?;
                    run_migrations(&migration_pool).await?;
                    migration_pool.close().await;
                } else {
                    tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
                }

                (
                    Arc::new(PgStore::new(pool.clone())),
                    Some(InvariantChecker::new(pool, clock.clone())),
                )
            }
            None => {
                tracing::warn!("DATABASE_URL not set - using in-memory store, data is not persisted");
                let now = clock.now();
                let pricing = PricingConfig::launch(now + DEV_LAUNCH_PERIOD, now);
                (Arc::new(MemoryStore::new(pricing)), None)
            }
        };

    let cache: Arc<dyn CacheInvalidator> = match &config.redis_url {
        Some(redis_url) => match RedisCacheInvalidator::connect(redis_url).await {
            Ok(cache) => {
                tracing::info!("Redis cache invalidation enabled");
                Arc::new(cache)
            }
            Err(e) => {
                tracing::error!(error = %e, "Redis unavailable - cache invalidation disabled");
                Arc::new(NoopCacheInvalidator)
            }
        },
        None => Arc::new(NoopCacheInvalidator),
    };

    let monetization = AppState::build_monetization(&config, store, cache, clock)?;
    let state = AppState::new(config.clone(), monetization, invariants);

    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([header::CONTENT_TYPE]);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
