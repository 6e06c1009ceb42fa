use std::path::PathBuf;

use axum::Json;
use axum::Router;
use axum::error_handling::HandleErrorLayer;
use axum::extract::Path;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use press_limit::RouteTable;
use tower::BoxError;
use tower::ServiceBuilder;
use tower_press::AdmissionError;
use tower_press::ManagedAdmissionLayer;
use tower_press::StacRouteClassifier;
use tower_press::settings::load_settings;
use tracing_subscriber::EnvFilter;

/// A toy STAC API guarded by per-route admission control.
#[derive(Debug, Parser)]
struct Args {
    /// Admission settings file (TOML, YAML or JSON). `ADMISSION__*`
    /// environment variables override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:3000")]
    listen: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // 1. Load and validate settings; anything invalid stops here.
    let config = load_settings(args.config.as_deref())?;

    // 2. One route table shared by every connection.
    let admission = ManagedAdmissionLayer::<_, Request>::new(
        RouteTable::new(&config),
        StacRouteClassifier::new(),
    );

    // 3. Build the Router
    let app = Router::new()
        .route("/collections", get(collections))
        .route("/collections/{id}", get(collection))
        .route("/collections/{id}/items", get(items))
        .route("/collections/{id}/items/{item_id}", get(item))
        .route("/search", get(search).post(search))
        .route("/healthz", get(|| async { "ok" }))
        .layer(
            ServiceBuilder::new()
                // Turns AdmissionError into 429 / 504 / 500 responses
                .layer(HandleErrorLayer::new(handle_admission_error))
                .layer(admission)
                // The router is Infallible; the admission stack speaks BoxError.
                .map_err(BoxError::from),
        );

    let listener = tokio::net::TcpListener::bind(&args.listen).await?;
    tracing::info!(address = %args.listen, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn handle_admission_error(err: BoxError) -> impl IntoResponse {
    if let Some(admission_err) = err.downcast_ref::<AdmissionError>() {
        admission_err.clone().into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Service Error").into_response()
    }
}

async fn collections() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "collections": [{ "id": "naip" }] }))
}

async fn collection(Path(id): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "id": id, "type": "Collection" }))
}

async fn items(Path(id): Path<String>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "type": "FeatureCollection",
        "collection": id,
        "features": [],
    }))
}

async fn item(Path((id, item_id)): Path<(String, String)>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "type": "Feature", "collection": id, "id": item_id }))
}

async fn search() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "type": "FeatureCollection", "features": [] }))
}
