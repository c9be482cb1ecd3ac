use std::env;
use std::net::SocketAddr;
use std::path::Path;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_UPLOAD_DIR: &str = "uploads/messages";

/// Process configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub upload_dir: String,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let port = env::var("CHAT_RELAY_PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let upload_dir =
            env::var("CHAT_RELAY_UPLOAD_DIR").unwrap_or_else(|_| DEFAULT_UPLOAD_DIR.to_string());

        Config {
            bind: SocketAddr::from(([0, 0, 0, 0], port)),
            upload_dir,
            tls_cert: env::var("CHAT_RELAY_CERT").ok(),
            tls_key: env::var("CHAT_RELAY_KEY").ok(),
        }
    }

    /// Certificate and key paths, but only when both files actually exist;
    /// otherwise the server falls back to plain ws.
    pub fn tls_paths(&self) -> Option<(&str, &str)> {
        match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (Some(cert), Some(key)) if Path::new(cert).exists() && Path::new(key).exists() => {
                Some((cert, key))
            }
            _ => None,
        }
    }
}
