use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coursegen_runtime::{
    config::Config,
    db,
    pipeline::{CourseGenerator, PipelineSettings},
    provider::OpenAiProvider,
    routes::{self, AppState},
    storage::{memory::MemoryStorage, postgres::PgStorage, Storage},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "coursegen_runtime=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let storage: Arc<dyn Storage> = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, config.db_max_connections).await?;
            db::migrate(&pool).await?;
            Arc::new(PgStorage::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory storage");
            Arc::new(MemoryStorage::new())
        }
    };
    let provider = Arc::new(OpenAiProvider::new(config.model.clone())?);
    let generator = CourseGenerator::new(
        storage,
        provider,
        PipelineSettings {
            lesson_batch_size: config.lesson_batch_size,
            job_timeout: config.job_timeout,
        },
    );

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(AppState { generator }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
