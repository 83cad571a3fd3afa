//! Server launcher.
//!
//! Usage: `ember-server [config.json]`
//!
//! Exit codes: 0 success, 1 bind failure, 2 persistence load failure,
//! 3 configuration error.

use ember::{Server, ServerConfig};
use std::path::Path;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load(Path::new(&path)) {
            Ok(config) => config,
            Err(e) => {
                error!(target: "ember::server", error = %e, "configuration error");
                std::process::exit(3);
            }
        },
        None => ServerConfig::default(),
    };

    let server = match Server::bootstrap(config) {
        Ok(server) => server,
        Err(e) => {
            error!(target: "ember::server", error = %e, "startup recovery failed");
            std::process::exit(2);
        }
    };

    let listener = match server.bind() {
        Ok(listener) => listener,
        Err(e) => {
            error!(target: "ember::server", error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    if let Ok(addr) = listener.local_addr() {
        info!(target: "ember::server", %addr, "listening");
    }
    server.serve(listener);
}
