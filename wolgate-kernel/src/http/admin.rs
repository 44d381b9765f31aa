//! Routes `/admin` : connexion en deux étapes, CRUD des serveurs, sécurité.
//!
//! Toute modification des serveurs est écrite sur disque et ne prend effet
//! qu'au prochain démarrage (`restart_required: true`).

use super::{api_error, session_token, ApiError, ApiResult, AppState, ClientAddr, SESSION_COOKIE};
use crate::config::ConfigError;
use crate::models::ServerDraft;
use crate::sessions::{AuthError, LoginOutcome, Session};
use crate::vault::VaultError;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use axum_extra::extract::CookieJar;
use serde::Deserialize;
use serde_json::{json, Value};
use time::format_description::well_known::Rfc3339;
use tracing::{error, info};

pub(super) fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/servers", get(list_servers).post(create_server))
        .route("/servers/{id}", put(update_server).delete(delete_server))
        .route("/security/password", post(change_password))
        .route("/security/2fa/enable", post(enable_2fa))
        .route("/security/2fa/confirm", post(confirm_2fa))
        .route("/security/2fa/disable", post(disable_2fa))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_session));

    Router::new()
        .route("/login", post(login))
        .route("/login/code", post(login_code))
        .route("/logout", post(logout))
        .merge(protected)
        .route_layer(middleware::from_fn_with_state(state, require_admin_enabled))
}

async fn require_admin_enabled(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !app.config.snapshot().admin_enabled {
        return Err(api_error(StatusCode::FORBIDDEN, "admin panel is disabled"));
    }
    Ok(next.run(req).await)
}

async fn require_session(
    State(app): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = session_token(&jar, req.headers())
        .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "login required"))?;
    let session = app
        .sessions
        .authorize(&token)
        .map_err(|e| api_error(StatusCode::UNAUTHORIZED, e.to_string()))?;
    req.extensions_mut().insert(session);
    Ok(next.run(req).await)
}

fn auth_error(app: &AppState, err: AuthError) -> ApiError {
    match err {
        AuthError::RateLimited => api_error(StatusCode::TOO_MANY_REQUESTS, err.to_string()),
        AuthError::BadCredentials | AuthError::BadCode => {
            app.health_tracker.record_login_failure();
            api_error(StatusCode::UNAUTHORIZED, err.to_string())
        }
    }
}

fn config_error(err: ConfigError) -> ApiError {
    match err {
        ConfigError::InvalidEntry(reason) => api_error(StatusCode::UNPROCESSABLE_ENTITY, reason),
        ConfigError::UnknownServer(_) => api_error(StatusCode::NOT_FOUND, err.to_string()),
        other => {
            error!("servers file error: {}", other);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "could not access the servers file")
        }
    }
}

fn vault_error(err: VaultError) -> ApiError {
    match err {
        VaultError::IncorrectPassword => api_error(StatusCode::FORBIDDEN, err.to_string()),
        VaultError::WeakPassword | VaultError::PasswordMismatch => {
            api_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        VaultError::NoPendingEnrollment => api_error(StatusCode::CONFLICT, err.to_string()),
        other => {
            error!("admin record error: {}", other);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "could not update the admin record")
        }
    }
}

/// Argon2 hors du runtime async.
async fn blocking<T, F>(f: F) -> ApiResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        error!("blocking task failed: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    })
}

/// `Max-Age` = durée de vie absolue : l'inactivité est contrôlée côté
/// serveur par `authorize`, le navigateur ne doit pas couper avant.
fn session_cookie(app: &AppState, session: &Session) -> String {
    let max_age = app.sessions.max_lifetime().whole_seconds().max(0);
    let secure = if app.cookie_secure { "; Secure" } else { "" };
    format!("{SESSION_COOKIE}={}; Path=/admin; HttpOnly; SameSite=Strict; Max-Age={max_age}{secure}", session.token)
}

fn authenticated(app: &AppState, session: &Session) -> Response {
    let body = json!({
        "ok": true,
        "stage": session.stage,
        "expires_at": session.expires_at.format(&Rfc3339).unwrap_or_default(),
    });
    ([(header::SET_COOKIE, session_cookie(app, session))], Json(body)).into_response()
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default)]
    code: Option<String>,
}

// POST /admin/login
async fn login(
    State(app): State<AppState>,
    ClientAddr(client): ClientAddr,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Response> {
    let sessions = app.sessions.clone();
    let outcome = blocking(move || {
        sessions.login(&client, &req.username, &req.password, req.code.as_deref())
    })
    .await?
    .map_err(|e| auth_error(&app, e))?;

    match outcome {
        LoginOutcome::Authenticated(session) => Ok(authenticated(&app, &session)),
        LoginOutcome::CodeRequired { challenge, rejected } => {
            let mut body = json!({ "ok": false, "stage": "password_ok", "challenge": challenge });
            if rejected {
                app.health_tracker.record_login_failure();
                body["msg"] = json!(AuthError::BadCode.to_string());
                return Ok((StatusCode::UNAUTHORIZED, Json(body)).into_response());
            }
            Ok(Json(body).into_response())
        }
    }
}

#[derive(Deserialize)]
struct CodeRequest {
    challenge: String,
    code: String,
}

// POST /admin/login/code
async fn login_code(
    State(app): State<AppState>,
    ClientAddr(client): ClientAddr,
    Json(req): Json<CodeRequest>,
) -> ApiResult<Response> {
    let session = app
        .sessions
        .submit_code(&client, &req.challenge, &req.code)
        .map_err(|e| auth_error(&app, e))?;
    Ok(authenticated(&app, &session))
}

// POST /admin/logout
async fn logout(State(app): State<AppState>, jar: CookieJar, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&jar, &headers) {
        app.sessions.logout(&token);
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/admin; HttpOnly; SameSite=Strict; Max-Age=0");
    ([(header::SET_COOKIE, cookie)], Json(json!({ "ok": true }))).into_response()
}

// GET /admin/servers
async fn list_servers(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let servers = app.config.persisted().map_err(config_error)?;
    let restart_required = app.config.pending_restart().map_err(config_error)?;
    Ok(Json(json!({
        "servers": servers,
        "running_version": app.config.snapshot().version,
        "restart_required": restart_required,
    })))
}

// POST /admin/servers
async fn create_server(
    State(app): State<AppState>,
    Json(draft): Json<ServerDraft>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (server, receipt) = app.config.add_server(draft).map_err(config_error)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "ok": true, "server": server, "version": receipt.version, "restart_required": receipt.restart_required })),
    ))
}

// PUT /admin/servers/{id}
async fn update_server(
    State(app): State<AppState>,
    Path(id): Path<u32>,
    Json(draft): Json<ServerDraft>,
) -> ApiResult<Json<Value>> {
    let (server, receipt) = app.config.update_server(id, draft).map_err(config_error)?;
    Ok(Json(json!({ "ok": true, "server": server, "version": receipt.version, "restart_required": receipt.restart_required })))
}

// DELETE /admin/servers/{id}
async fn delete_server(State(app): State<AppState>, Path(id): Path<u32>) -> ApiResult<Json<Value>> {
    let (server, receipt) = app.config.delete_server(id).map_err(config_error)?;
    Ok(Json(json!({ "ok": true, "server": server, "version": receipt.version, "restart_required": receipt.restart_required })))
}

#[derive(Deserialize)]
struct PasswordChange {
    current_password: String,
    new_password: String,
    confirm_password: String,
}

/// Re-vérification du mot de passe actuel, comptée par le throttle de connexion.
async fn reverify<F>(app: &AppState, client: &str, f: F) -> ApiResult<()>
where
    F: FnOnce() -> Result<(), VaultError> + Send + 'static,
{
    app.sessions.check_reverify(client).map_err(|e| auth_error(app, e))?;
    let result = blocking(f).await?;
    match &result {
        Ok(()) => app.sessions.record_reverify(client, true),
        Err(VaultError::IncorrectPassword) => {
            app.health_tracker.record_login_failure();
            app.sessions.record_reverify(client, false);
        }
        Err(_) => {}
    }
    result.map_err(vault_error)
}

// POST /admin/security/password
async fn change_password(
    State(app): State<AppState>,
    ClientAddr(client): ClientAddr,
    Extension(session): Extension<Session>,
    Json(req): Json<PasswordChange>,
) -> ApiResult<Json<Value>> {
    if req.new_password != req.confirm_password {
        return Err(vault_error(VaultError::PasswordMismatch));
    }
    let vault = app.vault.clone();
    reverify(&app, &client, move || vault.change_password(&req.current_password, &req.new_password)).await?;

    let revoked = app.sessions.revoke_others(&session.token);
    info!("password changed, {} other session(s) closed", revoked);
    Ok(Json(json!({ "ok": true, "msg": "password updated" })))
}

// POST /admin/security/2fa/enable
async fn enable_2fa(State(app): State<AppState>) -> ApiResult<Json<Value>> {
    let enrollment = app.vault.begin_enable_2fa().map_err(vault_error)?;
    Ok(Json(json!({
        "ok": true,
        "secret": enrollment.secret,
        "provisioning_uri": enrollment.provisioning_uri,
    })))
}

#[derive(Deserialize)]
struct ConfirmRequest {
    code: String,
}

// POST /admin/security/2fa/confirm
async fn confirm_2fa(State(app): State<AppState>, Json(req): Json<ConfirmRequest>) -> ApiResult<Json<Value>> {
    if !app.vault.confirm_2fa(&req.code).map_err(vault_error)? {
        return Err(api_error(StatusCode::BAD_REQUEST, AuthError::BadCode.to_string()));
    }
    Ok(Json(json!({ "ok": true, "msg": "two-factor authentication enabled" })))
}

#[derive(Deserialize)]
struct DisableRequest {
    password: String,
}

// POST /admin/security/2fa/disable
async fn disable_2fa(
    State(app): State<AppState>,
    ClientAddr(client): ClientAddr,
    Extension(session): Extension<Session>,
    Json(req): Json<DisableRequest>,
) -> ApiResult<Json<Value>> {
    let vault = app.vault.clone();
    reverify(&app, &client, move || vault.disable_2fa(&req.password)).await?;

    app.sessions.revoke_others(&session.token);
    Ok(Json(json!({ "ok": true, "msg": "two-factor authentication disabled" })))
}
