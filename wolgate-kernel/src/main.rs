/**
 * WOLGATE KERNEL - Point d'entrée du gateway Wake-on-LAN
 *
 * RÔLE : Charge réglages, serveurs et compte admin une seule fois, puis sert
 * l'API HTTP. Toute modification de configuration attend le redémarrage.
 *
 * USAGE :
 *   wolgate-kernel                    → sert l'API
 *   wolgate-kernel init-admin <user>  → (ré)initialise le compte admin,
 *                                       mot de passe lu dans WOLGATE_ADMIN_PASSWORD
 */

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use wolgate_kernel::config::{ConfigSource, ConfigStore};
use wolgate_kernel::health::HealthTracker;
use wolgate_kernel::http::{self, AppState};
use wolgate_kernel::sessions::SessionManager;
use wolgate_kernel::settings::Settings;
use wolgate_kernel::totp::TotpEngine;
use wolgate_kernel::vault::CredentialVault;
use wolgate_kernel::wol::WakeDispatcher;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::load().context("failed to load settings")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        None => serve(settings).await,
        Some("init-admin") => init_admin(&settings, args.get(1).map(String::as_str)),
        Some(other) => bail!("unknown command '{other}' (expected: init-admin <username>)"),
    }
}

fn init_admin(settings: &Settings, username: Option<&str>) -> Result<()> {
    let username = username
        .filter(|u| !u.trim().is_empty())
        .context("usage: wolgate-kernel init-admin <username>")?;
    let password = std::env::var("WOLGATE_ADMIN_PASSWORD")
        .context("WOLGATE_ADMIN_PASSWORD must hold the new admin password")?;

    let vault = CredentialVault::load(&settings.admin_file, &settings.issuer, Arc::new(TotpEngine::new()));
    vault
        .setup(username, &password, true)
        .with_context(|| format!("cannot write {}", settings.admin_file.display()))?;
    info!("admin account ready in {} (restart the gateway to apply)", settings.admin_file.display());
    Ok(())
}

async fn serve(settings: Settings) -> Result<()> {
    // configuration figée pour toute la vie du process
    let source = ConfigSource {
        servers_path: settings.servers_file.clone(),
        admin_path: settings.admin_file.clone(),
    };
    let config = ConfigStore::load(source)
        .with_context(|| format!("cannot load servers from {}", settings.servers_file.display()))?;
    let snapshot = config.snapshot();
    for reason in &snapshot.dropped {
        warn!("skipped server entry: {}", reason);
    }
    if !snapshot.admin_enabled {
        info!("admin panel disabled");
    }

    let totp = Arc::new(TotpEngine::new());
    let vault = Arc::new(CredentialVault::load(&settings.admin_file, &settings.issuer, totp));
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&vault),
        settings.session.policy(),
        settings.throttle.policy(),
    ));
    let dispatcher = Arc::new(WakeDispatcher::bind().await.context("cannot open UDP broadcast socket")?);

    // purge périodique des sessions expirées
    let purge = Arc::clone(&sessions);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            let purged = purge.purge_expired();
            if purged > 0 {
                info!("purged {} expired session(s)", purged);
            }
        }
    });

    let app_state = AppState {
        config: Arc::new(config),
        vault,
        sessions,
        dispatcher,
        health_tracker: HealthTracker::new(),
        wake: settings.wake.clone(),
        cookie_secure: settings.cookie_secure,
    };
    let app = http::build_router(app_state);

    let addr: SocketAddr = settings
        .listen
        .parse()
        .with_context(|| format!("invalid listen address '{}'", settings.listen))?;
    let listener = TcpListener::bind(addr).await.with_context(|| format!("cannot bind {addr}"))?;
    info!("listening on http://{addr}");
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .context("HTTP server failed")?;
    Ok(())
}
