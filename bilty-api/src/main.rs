use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bilty_api::{app, metrics::Metrics, state::AppState, worker, AuthConfig};
use bilty_core::repository::{ChangeFeed, ReservationStore};
use bilty_core::InMemoryReservationStore;
use bilty_store::{app_config::Config, DbClient, PgChangeFeed, PgReservationStore, RedisClient};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bilty_api=debug,tower_http=debug,axum::rejection=trace".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    let series = config.series().context("Invalid GR series in config")?;
    tracing::info!("Starting Bilty reservation API on port {}", config.server.port);

    let (store, feed): (Arc<dyn ReservationStore>, Arc<dyn ChangeFeed>) = match &config.database {
        Some(db_config) => {
            let db = DbClient::new(&db_config.url, db_config.max_connections)
                .await
                .context("Failed to connect to Postgres")?;
            if db_config.run_migrations {
                db.migrate().await.context("Failed to run migrations")?;
            }
            db.seed_series(&series).await.context("Failed to seed GR series")?;

            let (feed, _listener) = PgChangeFeed::start(&db.pool)
                .await
                .context("Failed to start reservation change feed")?;
            let store: Arc<dyn ReservationStore> =
                Arc::new(PgReservationStore::new(db.pool.clone(), config.reservations.max_range));
            let feed: Arc<dyn ChangeFeed> = Arc::new(feed);
            (store, feed)
        }
        None => {
            tracing::warn!("No database configured, reservations live in process memory only");
            let store = Arc::new(
                InMemoryReservationStore::new().with_max_range(config.reservations.max_range),
            );
            for s in series {
                store.register_series(s)?;
            }
            (store.clone() as Arc<dyn ReservationStore>, store as Arc<dyn ChangeFeed>)
        }
    };

    let redis = match &config.redis {
        Some(redis_config) => {
            let client = RedisClient::new(&redis_config.url)
                .await
                .context("Failed to connect to Redis")?;
            Some(Arc::new(client))
        }
        None => None,
    };

    let metrics = Arc::new(Metrics::new().context("Failed to build metrics registry")?);

    tokio::spawn(worker::start_sweep_worker(
        store.clone(),
        metrics.clone(),
        Duration::from_secs(config.reservations.sweep_interval_seconds.max(1)),
    ));

    let app_state = AppState {
        store,
        feed,
        redis,
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        rules: config.reservations.clone(),
        rate_limit_per_minute: config.server.rate_limit_per_minute,
        metrics,
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}
