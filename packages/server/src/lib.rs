#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! HTTP server hosting the proximity rooms.
//!
//! Binds `/ws` and `/health`, runs the [`ws::server::WsServer`] actor next to
//! actix and tears both down together.

mod api;
pub mod ws;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, dev::ServerHandle, http, middleware, web};
use proximity_config::RoomRegistry;
use proximity_media::MediaEngine;
use proximity_ws::ProximityState;
use tokio::try_join;

use crate::ws::server::{WsServer, WsServerHandle};

/// Shared with every actix worker through [`web::Data`].
#[derive(Debug)]
pub struct AppState {
    pub ws_server: WsServerHandle,
    pub state: Arc<ProximityState>,
}

/// # Errors
///
/// * If the server fails to bind to `addr:service_port`
/// * If the server fails during execution
pub async fn run<T>(
    addr: &str,
    service_port: u16,
    actix_workers: Option<usize>,
    rooms: RoomRegistry,
    engine: Arc<dyn MediaEngine>,
    on_startup: impl FnOnce(ServerHandle) -> T + Send,
) -> std::io::Result<T> {
    log::debug!(
        "run: serving rooms {:?}",
        rooms.ids().cloned().collect::<Vec<_>>()
    );

    let state = Arc::new(ProximityState::new(rooms, engine));

    let (ws_server, ws_server_handle) = WsServer::new(state.clone());
    let ws_server_join_handle = tokio::spawn(ws_server.run());

    let data = web::Data::new(AppState {
        ws_server: ws_server_handle.clone(),
        state,
    });

    let app = move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "OPTIONS"])
            .allowed_headers(vec![
                http::header::AUTHORIZATION,
                http::header::ACCEPT,
                http::header::CONTENT_TYPE,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .wrap(cors)
            .wrap(middleware::Compress::default())
            .app_data(data.clone())
            .service(api::health_endpoint)
            .service(api::websocket)
    };

    let http_server = {
        let mut http_server = actix_web::HttpServer::new(app).bind((addr, service_port))?;

        if let Some(workers) = actix_workers {
            log::debug!("Running with {workers} Actix workers");
            http_server = http_server.workers(workers);
        }

        http_server.run()
    };

    let resp = on_startup(http_server.handle());

    log::info!("Proximity server started on {addr}:{service_port}");

    try_join!(
        async move {
            let resp = http_server.await;

            log::debug!("Shutting down ws server...");
            ws_server_handle.shutdown();

            log::trace!("Connections shut down");

            resp
        },
        async move {
            let resp = ws_server_join_handle
                .await
                .map_err(std::io::Error::other)?;
            log::debug!("WsServer connection closed");
            resp
        },
    )?;

    log::debug!("Server shut down");

    Ok(resp)
}
