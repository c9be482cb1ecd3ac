use std::sync::Arc;

use log::{error, info};

use chat_relay::auth::TokenTable;
use chat_relay::config::Config;
use chat_relay::files::UploadStore;
use chat_relay::server::{routes, ChatServer};
use chat_relay::store::MemoryStore;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = Config::from_env();
    let store = Arc::new(MemoryStore::new());
    let auth = Arc::new(TokenTable::new(store.clone()));

    let uploads = match UploadStore::new(&config.upload_dir).await {
        Ok(uploads) => uploads,
        Err(e) => {
            error!("failed to create upload directory {}: {e}", config.upload_dir);
            std::process::exit(1);
        }
    };

    let server = Arc::new(ChatServer::new(store, auth, uploads));
    let routes = routes(server);

    match config.tls_paths() {
        Some((cert, key)) => {
            info!("starting secure server (wss) on {}", config.bind);
            warp::serve(routes)
                .tls()
                .cert_path(cert)
                .key_path(key)
                .run(config.bind)
                .await;
        }
        None => {
            info!("starting server (ws) on {}", config.bind);
            warp::serve(routes).run(config.bind).await;
        }
    }
}
