#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

use std::{sync::Arc, time::Duration};

use proximity_config::{
    ServerConfig,
    env::{default_env, default_env_u16, option_env_usize},
    load_config,
};
use proximity_media::{MediaEngine, simulator::SimulatedMediaEngine};

const DEFAULT_PORT: u16 = 9001;

/// Grace period between the media engine dying and the process exiting.
const DIED_EXIT_DELAY: Duration = Duration::from_secs(2);

fn main() -> std::io::Result<()> {
    proximity_logging::init().map_err(std::io::Error::other)?;

    let config = load_config().map_err(std::io::Error::other)?;
    let server_config = config.server.clone().unwrap_or_default();

    let args: Vec<String> = std::env::args().collect();

    let service_port = match args.get(1) {
        Some(port) => port.parse::<u16>().map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Invalid port argument '{port}': {e}"),
            )
        })?,
        None => default_env_u16("PORT", server_config.port.unwrap_or(DEFAULT_PORT))
            .map_err(std::io::Error::other)?,
    };

    let addr = bind_addr(&server_config);
    let actix_workers = option_env_usize("ACTIX_WORKERS")
        .map_err(std::io::Error::other)?
        .or(server_config.workers);

    actix_web::rt::System::new().block_on(async move {
        let engine: Arc<dyn MediaEngine> =
            Arc::new(SimulatedMediaEngine::new(&config.media_config()));

        let died = engine.clone();
        tokio::spawn(async move {
            died.died().await;
            log::error!(
                "Media engine died, exiting in {} seconds...",
                DIED_EXIT_DELAY.as_secs()
            );
            tokio::time::sleep(DIED_EXIT_DELAY).await;
            std::process::exit(1);
        });

        proximity_server::run(
            &addr,
            service_port,
            actix_workers,
            config.room_registry(),
            engine,
            |_| {},
        )
        .await
    })
}

fn bind_addr(server_config: &ServerConfig) -> String {
    default_env(
        "BIND_ADDR",
        server_config.host.as_deref().unwrap_or("0.0.0.0"),
    )
}
