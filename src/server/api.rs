use crate::conversation::{ group_by_day, DayGroup };
use crate::models::chat::{ Message, UsageRecord };
use crate::usage::UsageLimits;
use super::auth::{ self, Identity };
use super::ServerContext;
use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use axum::{
    routing::{ get, post },
    Router,
    extract::{ State, Query },
    response::{ IntoResponse, Response },
    http::{ header, StatusCode },
    Json,
};
use chrono::Utc;
use serde::{ Deserialize, Serialize };
use tower_http::cors::{ Any, CorsLayer };
use log::{ info, warn, error };

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tts: bool,
    search: bool,
}

#[derive(Serialize)]
struct HistoryResponse {
    user_id: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct ClearResponse {
    removed: usize,
}

#[derive(Serialize)]
struct DaysResponse {
    days: Vec<DayGroup>,
}

#[derive(Serialize)]
struct UsageResponse {
    usage: UsageRecord,
    daily_request_limit: u64,
    daily_token_limit: u64,
}

#[derive(Deserialize)]
pub struct TtsRequest {
    pub text: String,
}

#[derive(Serialize)]
struct ReloadResponse {
    success: bool,
    message: String,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: message.into() })).into_response()
}

fn identify(state: &ServerContext, params: &HashMap<String, String>) -> Result<Identity, Response> {
    auth::authenticate(params, state.args.server_api_key.as_deref(), Utc::now().timestamp()).map_err(|e| {
        warn!("Rejected API request: {}", e);
        error_response(StatusCode::UNAUTHORIZED, e.to_string())
    })
}

pub fn router(state: ServerContext) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/history", get(history_handler).delete(clear_history_handler))
        .route("/api/history/days", get(history_days_handler))
        .route("/api/usage", get(usage_handler))
        .route("/api/tts", post(tts_handler))
        .route("/api/reload-prompts", get(reload_prompts_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_http_server(
    http_port: u16,
    state: ServerContext
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let addr = format!("{}:{}", state.args.server_host(), http_port).parse::<SocketAddr>()?;
    info!("Starting HTTP API server on: http://{}", addr);

    let args = state.args.clone();
    let app = router(state);

    if args.enable_tls && args.tls_cert_path.is_some() && args.tls_key_path.is_some() {
        let (cert_path, key_path) = match (&args.tls_cert_path, &args.tls_key_path) {
            (Some(cert), Some(key)) => (cert.clone(), key.clone()),
            _ => {
                return Err("TLS enabled without cert/key".into());
            }
        };

        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert_path, key_path).await?;

        tokio::spawn(async move {
            let result = axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await;

            if let Err(e) = result {
                error!("HTTPS server error: {}", e);
            }
        });

        info!("HTTPS server started with TLS enabled");
    } else {
        tokio::spawn(async move {
            match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => {
                    if let Err(e) = axum::serve(listener, app.into_make_service()).await {
                        error!("HTTP server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Failed to bind HTTP server to {}: {}. Try a different port.", addr, e);
                }
            }
        });

        info!("HTTP server started");
    }

    Ok(())
}

async fn health_handler(State(state): State<ServerContext>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tts: state.tts.is_some(),
        search: state.args.search_enabled(),
    })
}

async fn history_handler(
    State(state): State<ServerContext>,
    Query(params): Query<HashMap<String, String>>
) -> Response {
    let identity = match identify(&state, &params) {
        Ok(identity) => identity,
        Err(response) => {
            return response;
        }
    };
    let limit = params.get("limit").and_then(|l| l.parse::<usize>().ok());

    match state.agent.history_store().get_messages(&identity.user_id, limit).await {
        Ok(messages) => Json(HistoryResponse { user_id: identity.user_id, messages }).into_response(),
        Err(e) => {
            error!("Failed to load history for {}: {}", identity.user_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load history")
        }
    }
}

async fn clear_history_handler(
    State(state): State<ServerContext>,
    Query(params): Query<HashMap<String, String>>
) -> Response {
    let identity = match identify(&state, &params) {
        Ok(identity) => identity,
        Err(response) => {
            return response;
        }
    };

    match state.agent.history_store().clear_messages(&identity.user_id).await {
        Ok(removed) => {
            info!("Cleared {} messages for {}", removed, identity.user_id);
            Json(ClearResponse { removed }).into_response()
        }
        Err(e) => {
            error!("Failed to clear history for {}: {}", identity.user_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to clear history")
        }
    }
}

async fn history_days_handler(
    State(state): State<ServerContext>,
    Query(params): Query<HashMap<String, String>>
) -> Response {
    let identity = match identify(&state, &params) {
        Ok(identity) => identity,
        Err(response) => {
            return response;
        }
    };

    match state.agent.history_store().get_messages(&identity.user_id, None).await {
        Ok(messages) => {
            let days = group_by_day(&messages, state.args.utc_offset_hours);
            Json(DaysResponse { days }).into_response()
        }
        Err(e) => {
            error!("Failed to load history for {}: {}", identity.user_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load history")
        }
    }
}

async fn usage_handler(
    State(state): State<ServerContext>,
    Query(params): Query<HashMap<String, String>>
) -> Response {
    let identity = match identify(&state, &params) {
        Ok(identity) => identity,
        Err(response) => {
            return response;
        }
    };
    let usage = state.agent.usage();
    let UsageLimits { daily_requests, daily_tokens } = usage.limits();

    match usage.current(&identity.user_id).await {
        Ok(record) =>
            Json(UsageResponse {
                usage: record,
                daily_request_limit: daily_requests,
                daily_token_limit: daily_tokens,
            }).into_response(),
        Err(e) => {
            error!("Failed to read usage for {}: {}", identity.user_id, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to read usage")
        }
    }
}

async fn tts_handler(
    State(state): State<ServerContext>,
    Query(params): Query<HashMap<String, String>>,
    Json(req): Json<TtsRequest>
) -> Response {
    if let Err(response) = identify(&state, &params) {
        return response;
    }
    let tts = match &state.tts {
        Some(tts) => tts,
        None => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, "TTS is not configured");
        }
    };
    if req.text.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Text is required");
    }

    match tts.synthesize(&req.text).await {
        Ok(audio) => ([(header::CONTENT_TYPE, audio.mime_type)], audio.bytes).into_response(),
        Err(e) => {
            error!("TTS synthesis failed: {}", e);
            error_response(StatusCode::BAD_GATEWAY, "TTS synthesis failed")
        }
    }
}

async fn reload_prompts_handler(State(state): State<ServerContext>) -> Response {
    match state.agent.reload_prompts_if_changed().await {
        Ok(true) =>
            Json(ReloadResponse { success: true, message: "Prompts reloaded".into() }).into_response(),
        Ok(false) =>
            Json(ReloadResponse { success: true, message: "Prompts unchanged".into() }).into_response(),
        Err(e) =>
            (
                StatusCode::BAD_REQUEST,
                Json(ReloadResponse { success: false, message: format!("Reload error: {}", e) }),
            ).into_response(),
    }
}
