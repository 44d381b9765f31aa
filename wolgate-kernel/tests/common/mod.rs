#![allow(dead_code)]

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tower::ServiceExt;

use wolgate_devkit::{ServerFixture, TestHarness};
use wolgate_kernel::config::{ConfigSource, ConfigStore};
use wolgate_kernel::health::HealthTracker;
use wolgate_kernel::http::{build_router, AppState, SESSION_COOKIE};
use wolgate_kernel::sessions::{SessionManager, SessionPolicy};
use wolgate_kernel::settings::WakeConf;
use wolgate_kernel::throttle::ThrottlePolicy;
use wolgate_kernel::totp::TotpEngine;
use wolgate_kernel::vault::CredentialVault;
use wolgate_kernel::wol::WakeDispatcher;

pub const ADMIN: &str = "admin";
pub const PASSWORD: &str = "correct horse battery";

pub enum AdminMode {
    Disabled,
    Enabled,
}

pub struct Gateway {
    pub harness: TestHarness,
    pub app: Router,
    pub vault: Arc<CredentialVault>,
    pub sessions: Arc<SessionManager>,
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl Gateway {
    pub async fn start(admin: AdminMode, repeat: u32) -> Gateway {
        let harness = TestHarness::new().await.unwrap();
        let servers = [
            harness.loopback_server(1, "NAS").mac("00:11:22:33:44:55").wait_seconds(45),
            harness.loopback_server(2, "Media"),
        ];
        Self::start_with(harness, &servers, admin, repeat).await
    }

    pub async fn start_with(
        harness: TestHarness,
        servers: &[ServerFixture],
        admin: AdminMode,
        repeat: u32,
    ) -> Gateway {
        harness.write_servers(1, servers).unwrap();

        let vault = Arc::new(CredentialVault::load(
            harness.admin_path(),
            "WOL Gateway",
            Arc::new(TotpEngine::new()),
        ));
        match admin {
            AdminMode::Disabled => harness.write_admin(false, ADMIN).unwrap(),
            AdminMode::Enabled => vault.setup(ADMIN, PASSWORD, true).unwrap(),
        }

        let config = ConfigStore::load(ConfigSource {
            servers_path: harness.servers_path(),
            admin_path: harness.admin_path(),
        })
        .unwrap();
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&vault),
            SessionPolicy::default(),
            ThrottlePolicy::default(),
        ));
        let state = AppState {
            config: Arc::new(config),
            vault: Arc::clone(&vault),
            sessions: Arc::clone(&sessions),
            dispatcher: Arc::new(WakeDispatcher::bind().await.unwrap()),
            health_tracker: HealthTracker::new(),
            wake: WakeConf {
                port: harness.capture.port(),
                repeat,
                repeat_interval_ms: 10,
            },
            cookie_secure: false,
        };

        Gateway {
            app: build_router(state),
            harness,
            vault,
            sessions,
        }
    }

    pub async fn call(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> Reply {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::COOKIE, format!("{SESSION_COOKIE}={token}"));
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let resp = self.app.clone().oneshot(request).await.unwrap();
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        Reply { status, headers, body }
    }

    /// Connexion sans 2FA, renvoie le jeton du cookie.
    pub async fn login(&self) -> String {
        let reply = self
            .call(
                Method::POST,
                "/admin/login",
                None,
                Some(serde_json::json!({ "username": ADMIN, "password": PASSWORD })),
            )
            .await;
        assert_eq!(reply.status, StatusCode::OK, "{}", reply.body);
        session_cookie(&reply).expect("login must set the session cookie")
    }
}

pub fn session_cookie(reply: &Reply) -> Option<String> {
    let raw = reply.headers.get(header::SET_COOKIE)?.to_str().ok()?;
    let value = raw.split(';').next()?.strip_prefix(&format!("{SESSION_COOKIE}="))?;
    (!value.is_empty()).then(|| value.to_string())
}
