use env_logger::Env;
use std::net::SocketAddr;
use std::sync::Arc;

use wardgate::{
    build_router,
    clock::{SharedClock, SystemClock},
    config::{Config, StoreBackend},
    database::{CounterStore, MemoryStore, RedisManager, SessionStore},
    AppState,
};

async fn connect(url: &str, config: &Config, name: &str) -> Arc<RedisManager> {
    match RedisManager::new(url, config.store_timeout).await {
        Ok(redis) => {
            println!("✅ {} connection established successfully", name);
            Arc::new(redis)
        }
        Err(e) => {
            eprintln!("❌ Failed to connect to {}: {}", name, e);
            eprintln!("Check REDIS_URL / SESSION_REDIS_URL");
            std::process::exit(1);
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        eprintln!("❌ Failed to listen for shutdown signal: {}", e);
    }
    println!("🛑 Shutting down");
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    env_logger::init_from_env(Env::default().default_filter_or(&config.rust_log()));
    let bind_address = format!("{}:{}", config.host, config.port);

    let clock: SharedClock = Arc::new(SystemClock);

    let (counters, sessions): (Arc<dyn CounterStore>, Arc<dyn SessionStore>) = match config.store_backend {
        StoreBackend::Redis => {
            let counters = connect(&config.redis_url, &config, "Counter store").await;
            let sessions = if config.session_redis_url == config.redis_url {
                counters.clone()
            } else {
                connect(&config.session_redis_url, &config, "Session store").await
            };
            (counters as Arc<dyn CounterStore>, sessions as Arc<dyn SessionStore>)
        }
        StoreBackend::Memory => {
            println!("⚠️  Using in-memory stores; state is lost on restart");
            let store = Arc::new(MemoryStore::new(clock.clone()));
            (store.clone() as Arc<dyn CounterStore>, store as Arc<dyn SessionStore>)
        }
    };

    if config.idp_secret.is_none() {
        println!("⚠️  IDP_SHARED_SECRET not set; identity provider routes will refuse every call");
    }
    if config.trusted_proxies.is_empty() {
        println!("⚠️  No TRUSTED_PROXIES; forwarding headers are ignored and clients are keyed on the socket peer");
    }

    let state = AppState::new(counters, sessions, &config, clock);
    println!("✅ Gateway components initialized successfully");

    let app = build_router(&state);

    println!("🚀 Starting server at http://{}", bind_address);

    // Create the listener
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .unwrap_or_else(|e| {
            eprintln!("❌ Failed to bind to {}: {}", bind_address, e);
            std::process::exit(1);
        });

    // Start the server
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap_or_else(|e| {
            eprintln!("❌ Server error: {}", e);
            std::process::exit(1);
        });
}
