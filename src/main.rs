use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

use openbyte::config::ServerConfig;
use openbyte::dataplane::DataPlane;
use openbyte::server;
use openbyte::AppState;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!();
    println!("╔══════════════════════════════════════════════════╗");
    println!("║   📡  OPENBYTE NETWORK TEST SERVER               ║");
    println!("╚══════════════════════════════════════════════════╝");
    println!();

    // ── 1. Configuration ─────────────────────────────────────────
    // Loading from YAML/flags happens in the outer wrapper; the core
    // starts from defaults here.
    let config = ServerConfig::default();
    if let Err(message) = config.validate() {
        eprintln!("invalid configuration: {message}");
        std::process::exit(2);
    }

    // ── 2. Shared state + background loops ───────────────────────
    let state = AppState::new(config.clone());
    state.manager.spawn_ticker();
    state.manager.spawn_sweeper();

    // ── 3. Data-plane listeners ──────────────────────────────────
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let max_session = Duration::from_secs(config.max_test_duration + 30);
    let plane = DataPlane::bind(
        &config.bind_address,
        config.tcp_test_port,
        config.udp_test_port,
        max_session,
        shutdown_rx,
    )
    .await
    .expect("failed to bind data-plane listeners — are the test ports in use?");

    // ── 4. Control plane ─────────────────────────────────────────
    let app = server::create_router(state);
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|_| panic!("failed to bind {addr} — is the port already in use?"));

    info!(control = %addr, tcp = %plane.tcp_addr, udp = %plane.udp_addr, "openbyte listening");
    println!("Control plane   → http://{addr}/api/v1");
    println!("TCP test port   → {}", plane.tcp_addr);
    println!("UDP test port   → {}", plane.udp_addr);
    println!();

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server exited with error");
}
