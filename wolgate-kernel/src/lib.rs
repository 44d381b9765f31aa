//! WOL Gateway : réveil de machines par magic packet et panneau admin
//! protégé (argon2 + TOTP).

pub mod config;
pub mod health;
pub mod http;
pub mod models;
pub mod persist;
pub mod sessions;
pub mod settings;
pub mod throttle;
pub mod totp;
pub mod vault;
pub mod wol;
