//! Relay server
//!
//! Usage: `relay-server [--config <file>] [--listen <addr:port>]
//! [--public-ip <ip>] [--workers <n>] [--metrics-port <port>]`
//!
//! Flags override values from the config file.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use relay_server::{RelayConfig, RelayServer};

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let config = load_config(&args)?;

    log::info!("Relay server starting...");
    log::info!("  Listen:    {}", config.listen);
    log::info!("  Public IP: {}", config.advertised_ip());
    log::info!("  Workers:   {}", config.workers);
    log::info!(
        "  Limits:    {} allocations, {} per address, {} permissions, {} channels",
        config.max_allocations,
        config.max_allocations_per_ip,
        config.max_permissions,
        config.max_channels
    );

    // SIGINT/SIGTERM stop the loops
    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&shutdown))?;

    let mut server = RelayServer::bind(config, shutdown)?;
    server.run()?;

    log::info!("Relay server stopped");
    Ok(())
}

fn load_config(args: &[String]) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let mut config = match parse_arg(args, "--config") {
        Some(path) => RelayConfig::from_file(&path)?,
        None => RelayConfig::default(),
    };

    if let Some(listen) = parse_arg(args, "--listen") {
        config.listen = listen
            .parse::<SocketAddr>()
            .map_err(|_| "Invalid listen address")?;
    }
    if let Some(ip) = parse_arg(args, "--public-ip") {
        config.public_ip = Some(ip.parse::<IpAddr>().map_err(|_| "Invalid public IP")?);
    }
    if let Some(workers) = parse_arg(args, "--workers") {
        config.workers = workers.parse().map_err(|_| "Invalid worker count")?;
    }
    if let Some(port) = parse_arg(args, "--metrics-port") {
        config.metrics_port = Some(port.parse().map_err(|_| "Invalid metrics port")?);
    }

    config.validate()?;
    Ok(config)
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
