use std::net::TcpListener as StdTcpListener;
use std::sync::Arc;

use axum::Router;
use syncroom_relay::api;
use syncroom_relay::config::Config;
use syncroom_relay::persist::SqliteStore;
use syncroom_relay::registry::RoomRegistry;
use syncroom_relay::ws;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_banner() {
    eprintln!();
    eprintln!("  \x1b[1;36msyncroom\x1b[0m v{VERSION}");
    eprintln!("  \x1b[2mRoom-multiplexed document sync relay\x1b[0m");
    eprintln!();
}

fn print_connection_info(ws_port: u16, http_port: u16, bind: &str) {
    eprintln!("  \x1b[1;32m[ws]\x1b[0m     Relay listening on port \x1b[1;96m{ws_port}\x1b[0m");
    eprintln!("  \x1b[1;32m[http]\x1b[0m   Status API on port \x1b[1;96m{http_port}\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[1;37m>\x1b[0m Connect: \x1b[4;96mws://{bind}:{ws_port}/<room>\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mPress Ctrl+C to stop\x1b[0m");
    eprintln!();
}

/// Graceful start: Check if port is available
fn check_port_available(bind: &str, port: u16) -> bool {
    StdTcpListener::bind(format!("{bind}:{port}")).is_ok()
}

/// Graceful start: Find available port starting from default
fn find_available_port(bind: &str, start: u16) -> Option<u16> {
    (start..start + 10).find(|&port| check_port_available(bind, port))
}

fn resolve_port(bind: &str, preferred: u16, label: &str) -> u16 {
    if check_port_available(bind, preferred) {
        return preferred;
    }
    eprintln!("  \x1b[1;33m[warn]\x1b[0m   {label} port {preferred} in use, finding alternative...");
    match find_available_port(bind, preferred + 1) {
        Some(port) => {
            eprintln!("  \x1b[1;32m[check]\x1b[0m  Using {label} port {port}");
            port
        }
        None => {
            eprintln!(
                "  \x1b[1;31m[error]\x1b[0m  No available {label} ports in range {}-{}",
                preferred,
                preferred + 10
            );
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging (tracing)
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() > 1 {
        match args[1].as_str() {
            "--version" | "-v" => {
                println!("syncroom-relay {VERSION}");
                return Ok(());
            }
            "--help" | "-h" => {
                println!("syncroom-relay - Room-multiplexed document sync relay");
                println!();
                println!("USAGE:");
                println!("    syncroom-relay [OPTIONS]");
                println!();
                println!("OPTIONS:");
                println!("    -h, --help       Print help information");
                println!("    -v, --version    Print version");
                println!();
                println!("CONFIG:");
                println!("    ~/.config/syncroom/config.toml");
                return Ok(());
            }
            _ => {}
        }
    }

    print_banner();

    // === LOAD CONFIGURATION ===
    Config::create_default_if_missing();
    let config = Config::load();
    eprintln!(
        "  \x1b[1;32m[config]\x1b[0m Loaded from {}",
        Config::default_config_path().display()
    );

    // === GRACEFUL START ===
    let ws_port = resolve_port(&config.server.bind, config.server.ws_port, "WS");
    let http_port = resolve_port(&config.server.bind, config.server.http_port, "HTTP");

    // === SNAPSHOT STORE ===
    let db_path = config.db_path();
    let store = Arc::new(SqliteStore::open(&db_path)?);
    eprintln!(
        "  \x1b[1;32m[store]\x1b[0m  Snapshots at {}",
        db_path.display()
    );

    let registry = RoomRegistry::new(store, config.save_debounce());
    let shutdown_registry = registry.clone();

    print_connection_info(ws_port, http_port, &config.server.bind);

    // === STATUS API SERVER (axum) ===
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app_state = api::AppState {
        registry: registry.clone(),
        ws_port,
    };

    let app = Router::new()
        .nest("/api", api::api_router())
        .with_state(app_state)
        .layer(cors);

    let http_addr = format!("{}:{}", config.server.bind, http_port);
    let http_listener = tokio::net::TcpListener::bind(&http_addr).await?;
    let http_server = axum::serve(http_listener, app);

    // === RELAY SERVER ===
    let ws_addr = format!("{}:{}", config.server.bind, ws_port);
    let ws_listener = tokio::net::TcpListener::bind(&ws_addr).await?;

    // === GRACEFUL SHUTDOWN HANDLER ===
    let shutdown_signal = async {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            () = ctrl_c => {},
            () = terminate => {},
        }

        eprintln!();
        eprintln!("  \x1b[1;33m[stop]\x1b[0m   Graceful shutdown initiated...");

        // Write out any snapshot still waiting on its debounce window
        shutdown_registry.flush_dirty().await;

        eprintln!("  \x1b[1;32m[done]\x1b[0m   All snapshots flushed.");
        eprintln!();
    };

    // Run both servers concurrently with shutdown handler
    tokio::select! {
        result = ws::serve(ws_listener, registry, config.ping_interval(), config.presence_window()) => {
            result?;
        }
        result = http_server => {
            if let Err(e) = result {
                eprintln!("  \x1b[1;31m[error]\x1b[0m  HTTP server error: {e}");
            }
        }
        () = shutdown_signal => {
            // Shutdown was triggered
        }
    }

    Ok(())
}
