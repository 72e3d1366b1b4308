//! HTTP control API.
//!
//! Actix routes for play/stop commands and session status. Commands are forwarded to the
//! playback worker; handlers never block on a session start.

use std::net::SocketAddr;

use actix_web::middleware::Logger;
use actix_web::{App, HttpResponse, HttpServer, Responder, get, post, web};
use serde::Serialize;
use stream_sync_types::PlayRequest;

use crate::player::{PlayerCommand, PlayerHandle};

#[derive(Serialize)]
pub(crate) struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(mut builder: actix_web::HttpResponseBuilder, message: &str) -> HttpResponse {
    builder.json(ErrorResponse {
        error: message.to_string(),
    })
}

#[get("/health")]
pub(crate) async fn health() -> impl Responder {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[get("/status")]
pub(crate) async fn status(state: web::Data<PlayerHandle>) -> impl Responder {
    HttpResponse::Ok().json(state.status())
}

#[post("/play")]
pub(crate) async fn play(state: web::Data<PlayerHandle>, body: web::Json<PlayRequest>) -> impl Responder {
    let PlayRequest {
        url,
        format,
        placement,
    } = body.into_inner();
    let url = url.trim().to_string();
    if url.is_empty() {
        return error_response(HttpResponse::BadRequest(), "url is required");
    }
    tracing::info!(url = %url, format = format.as_deref().unwrap_or("auto"), "play request");
    match state.send(PlayerCommand::Play {
        url,
        format,
        placement,
    }) {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(_) => error_response(HttpResponse::InternalServerError(), "player offline"),
    }
}

#[post("/stop")]
pub(crate) async fn stop(state: web::Data<PlayerHandle>) -> impl Responder {
    tracing::info!("stop request");
    match state.send(PlayerCommand::Stop) {
        Ok(()) => HttpResponse::Accepted().finish(),
        Err(_) => error_response(HttpResponse::InternalServerError(), "player offline"),
    }
}

/// Run the API on its own thread with a dedicated actix system.
pub(crate) fn spawn_http_server(
    bind: SocketAddr,
    handle: PlayerHandle,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("http-api".to_string())
        .spawn(move || {
            let system = actix_web::rt::System::new();
            if let Err(e) = system.block_on(serve(bind, handle)) {
                tracing::error!(bind = %bind, error = %e, "http server failed");
            }
        })
}

async fn serve(bind: SocketAddr, handle: PlayerHandle) -> std::io::Result<()> {
    let state = web::Data::new(handle);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(Logger::default().exclude("/status").exclude("/health"))
            .service(health)
            .service(status)
            .service(play)
            .service(stop)
    })
    .bind(bind)?;
    tracing::info!(bind = %bind, "http api listening");
    server.run().await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::http::StatusCode;
    use actix_web::{App, test};
    use crossbeam_channel::Receiver;
    use stream_sync::config::SyncConfig;
    use stream_sync::session::StreamPlayer;
    use stream_sync::sim::{ManualVoiceFactory, SyntheticOpener};
    use stream_sync_types::{Placement, SessionStatus};

    use super::*;

    fn make_state() -> (web::Data<PlayerHandle>, Receiver<PlayerCommand>) {
        let player = Arc::new(StreamPlayer::new(
            Arc::new(SyntheticOpener::test_pattern()),
            Arc::new(ManualVoiceFactory::default()),
            SyncConfig::default(),
        ));
        let (handle, rx) = PlayerHandle::channel(player);
        (web::Data::new(handle), rx)
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let app = test::init_service(App::new().service(health)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], "ok");
    }

    #[actix_web::test]
    async fn status_is_idle_without_session() {
        let (state, _rx) = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(status)).await;
        let req = test::TestRequest::get().uri("/status").to_request();
        let body: SessionStatus = test::call_and_read_body_json(&app, req).await;
        assert!(!body.active);
        assert_eq!(body.url, None);
        assert_eq!(body.end_reason, None);
    }

    #[actix_web::test]
    async fn play_forwards_request_to_worker() {
        let (state, rx) = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(play)).await;

        let placement = Placement {
            start: [0.0, 1.0, 2.0],
            end: [1.0, 1.0, 2.0],
            yaw: 90.0,
        };
        let payload = PlayRequest {
            url: " http://example.com/live/index.m3u8 ".to_string(),
            format: Some("m3u8".to_string()),
            placement: Some(placement),
        };
        let req = test::TestRequest::post()
            .uri("/play")
            .set_json(&payload)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        assert_eq!(
            rx.try_recv().expect("command forwarded"),
            PlayerCommand::Play {
                url: "http://example.com/live/index.m3u8".to_string(),
                format: Some("m3u8".to_string()),
                placement: Some(placement),
            }
        );
    }

    #[actix_web::test]
    async fn play_without_url_is_rejected() {
        let (state, rx) = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(play)).await;
        let req = test::TestRequest::post()
            .uri("/play")
            .set_json(serde_json::json!({ "url": "   " }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[actix_web::test]
    async fn stop_forwards_command() {
        let (state, rx) = make_state();
        let app = test::init_service(App::new().app_data(state.clone()).service(stop)).await;
        let req = test::TestRequest::post().uri("/stop").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        assert_eq!(rx.try_recv().expect("command forwarded"), PlayerCommand::Stop);
    }

    #[actix_web::test]
    async fn commands_fail_when_worker_is_gone() {
        let (state, rx) = make_state();
        drop(rx);
        let app = test::init_service(App::new().app_data(state.clone()).service(stop)).await;
        let req = test::TestRequest::post().uri("/stop").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
