/**
 * API REST WOLGATE - Serveur HTTP du gateway
 *
 * ROUTES PUBLIQUES :
 * - GET /health, GET /system/health
 * - GET /servers : liste publique (id, nom, délai d'attente)
 * - POST /wake/{id}, POST /wake (premier serveur configuré)
 *
 * ROUTES ADMIN : voir `admin`. 403 si le panneau est désactivé dans le
 * snapshot de démarrage, 401 sans session valide (cookie ou Bearer).
 *
 * Les erreurs sont renvoyées en `(StatusCode, Json)` avec `{ok, msg}`.
 */

mod admin;

use crate::config::ConfigStore;
use crate::health::{HealthTracker, KernelHealth};
use crate::models::ServerEntry;
use crate::sessions::SessionManager;
use crate::settings::WakeConf;
use crate::vault::CredentialVault;
use crate::wol::{WakeDispatcher, WakeError};
use axum::extract::{ConnectInfo, FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::CookieJar;
use serde::Serialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

pub const SESSION_COOKIE: &str = "wolgate_admin_session";

pub(crate) type ApiError = (StatusCode, Json<Value>);
pub(crate) type ApiResult<T> = Result<T, ApiError>;

pub(crate) fn api_error(code: StatusCode, msg: impl Into<String>) -> ApiError {
    (code, Json(json!({ "ok": false, "msg": msg.into() })))
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub vault: Arc<CredentialVault>,
    pub sessions: Arc<SessionManager>,
    pub dispatcher: Arc<WakeDispatcher>,
    pub health_tracker: HealthTracker,
    pub wake: WakeConf,
    pub cookie_secure: bool,
}

/// Adresse IP du client, ou "unknown" si le serveur n'a pas été lancé
/// avec `into_make_service_with_connect_info`.
pub struct ClientAddr(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let addr = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Ok(Self(addr))
    }
}

/// Jeton de session : cookie d'abord, puis `Authorization: Bearer`.
pub(crate) fn session_token(jar: &CookieJar, headers: &HeaderMap) -> Option<String> {
    if let Some(cookie) = jar.get(SESSION_COOKIE) {
        return Some(cookie.value().to_string());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/servers", get(list_servers))
        .route("/wake", get(wake_default).post(wake_default))
        .route("/wake/{id}", post(wake_by_id))
        .nest("/admin", admin::router(app_state.clone()))
        .with_state(app_state)
}

#[derive(Serialize)]
struct PublicServer {
    id: u32,
    name: String,
    wait_seconds: u64,
}

// GET /servers
async fn list_servers(State(app): State<AppState>) -> Json<Vec<PublicServer>> {
    let snapshot = app.config.snapshot();
    let list = snapshot
        .servers
        .iter()
        .map(|s| PublicServer {
            id: s.id,
            name: s.name.clone(),
            wait_seconds: s.wait_seconds,
        })
        .collect();
    Json(list)
}

// POST /wake/{id}
async fn wake_by_id(
    State(app): State<AppState>,
    ClientAddr(client): ClientAddr,
    Path(id): Path<u32>,
) -> ApiResult<Json<Value>> {
    let entry = app
        .config
        .get(id)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "unknown server"))?;
    wake(&app, &client, &entry).await
}

// GET|POST /wake (ancienne route mono-serveur, ouverte depuis un favori)
async fn wake_default(
    State(app): State<AppState>,
    ClientAddr(client): ClientAddr,
) -> ApiResult<Json<Value>> {
    let snapshot = app.config.snapshot();
    let entry = snapshot
        .first()
        .cloned()
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "no server configured"))?;
    wake(&app, &client, &entry).await
}

async fn wake(app: &AppState, client: &str, entry: &ServerEntry) -> ApiResult<Json<Value>> {
    let result = dispatch(app, entry).await;
    app.health_tracker.record_wake(result.is_ok());
    match result {
        Ok(()) => {
            info!("wake '{}' ({}) requested by {}", entry.name, entry.mac, client);
            Ok(Json(json!({
                "ok": true,
                "server": entry.name,
                "redirect_url": entry.site_url,
                "wait_seconds": entry.wait_seconds,
                "msg": "magic packet sent",
            })))
        }
        Err(WakeError::SendFailure(e)) => {
            warn!("wake '{}' failed: {}", entry.name, e);
            Err(api_error(StatusCode::BAD_GATEWAY, "could not send magic packet"))
        }
        Err(e @ WakeError::InvalidMac(_)) => {
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// Envoie `wake.repeat` paquets espacés de `wake.repeat_interval_ms`.
async fn dispatch(app: &AppState, entry: &ServerEntry) -> Result<(), WakeError> {
    for i in 0..app.wake.repeat.max(1) {
        if i > 0 {
            tokio::time::sleep(app.wake.interval()).await;
        }
        app.dispatcher.wake(entry, app.wake.port).await?;
    }
    Ok(())
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let snapshot = app.config.snapshot();
    Json(app.health_tracker.get_health(&snapshot, &app.sessions))
}
