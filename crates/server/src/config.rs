use std::collections::HashMap;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub jwt_secret: String,
    pub token_ttl_seconds: i64,
    pub public_base_url: String,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:3000".into(),
            database_url: "sqlite://./data/chat.db".into(),
            jwt_secret: "dev-secret-change-me".into(),
            token_ttl_seconds: 7 * 24 * 3600,
            public_base_url: "http://localhost:3000".into(),
            max_upload_bytes: 100 * 1024 * 1024,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = std::fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind_addr") {
                settings.server_bind = v.clone();
            }
            if let Some(v) = file_cfg.get("database_url") {
                settings.database_url = v.clone();
            }
            if let Some(v) = file_cfg.get("jwt_secret") {
                settings.jwt_secret = v.clone();
            }
            if let Some(v) = file_cfg.get("public_base_url") {
                settings.public_base_url = v.clone();
            }
            if let Some(v) = file_cfg.get("token_ttl_seconds") {
                if let Ok(parsed) = v.parse() {
                    settings.token_ttl_seconds = parsed;
                }
            }
            if let Some(v) = file_cfg.get("max_upload_bytes") {
                if let Ok(parsed) = v.parse() {
                    settings.max_upload_bytes = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("JWT_SECRET") {
        settings.jwt_secret = v;
    }
    if let Ok(v) = std::env::var("PUBLIC_BASE_URL") {
        settings.public_base_url = v;
    }
    if let Ok(v) = std::env::var("TOKEN_TTL_SECONDS") {
        if let Ok(parsed) = v.parse() {
            settings.token_ttl_seconds = parsed;
        }
    }
    if let Ok(v) = std::env::var("MAX_UPLOAD_BYTES") {
        if let Ok(parsed) = v.parse() {
            settings.max_upload_bytes = parsed;
        }
    }

    settings
}
