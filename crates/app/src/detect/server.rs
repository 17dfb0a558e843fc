//! Actix Web preview server: latest frame, MJPEG stream, detection snapshots
//! and Prometheus metrics.
//!
//! Runs on its own thread with its own actix system so the detection loop
//! never touches an async runtime.

use std::{sync::Arc, thread, time::Duration};

use actix_web::{
    App, HttpResponse, HttpServer,
    http::header,
    web::{Bytes, Data, Query, get},
};
use anyhow::{Context, Result};
use async_stream::stream;
use serde::Deserialize;
use tokio::sync::oneshot;
use tracing::{error, info};
use vision::telemetry;

use super::data::{DetectionSnapshot, PreviewPacket, PreviewStore};
use crate::html::PREVIEW_HTML;

const MJPEG_BOUNDARY: &str = "frame";
const MJPEG_POLL: Duration = Duration::from_millis(33);

/// Running server; [`PreviewServer::stop`] shuts it down gracefully.
pub(crate) struct PreviewServer {
    stop_tx: oneshot::Sender<()>,
    thread: thread::JoinHandle<()>,
}

impl PreviewServer {
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.thread.join().is_err() {
            error!("preview server thread panicked");
        }
    }
}

#[derive(Deserialize)]
struct FrameQuery {
    frame: Option<u64>,
}

pub(crate) fn spawn_preview_server(port: u16, store: Arc<PreviewStore>) -> Result<PreviewServer> {
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let thread = telemetry::spawn_thread("preview-server", move || {
        let system = actix_web::rt::System::new();
        let served = system.block_on(async move {
            let store = Data::from(store);
            let server = HttpServer::new(move || {
                App::new()
                    .app_data(store.clone())
                    .route("/", get().to(index))
                    .route("/frame.jpg", get().to(frame_jpeg))
                    .route("/stream.mjpg", get().to(mjpeg_stream))
                    .route("/detections", get().to(detections))
                    .route("/metrics", get().to(prometheus_metrics))
            })
            .workers(1)
            .bind(("0.0.0.0", port))?
            .run();
            info!(port, "preview server listening");

            let handle = server.handle();
            actix_web::rt::spawn(async move {
                let _ = stop_rx.await;
                handle.stop(true).await;
            });
            server.await
        });
        if let Err(err) = served {
            error!(port, "preview server failed: {err}");
        }
    })
    .context("failed to spawn preview server thread")?;

    Ok(PreviewServer { stop_tx, thread })
}

fn jpeg(packet: PreviewPacket) -> HttpResponse {
    HttpResponse::Ok()
        .insert_header(("X-Sequence", packet.frame_number.to_string()))
        .content_type("image/jpeg")
        .body(packet.jpeg)
}

async fn index() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(PREVIEW_HTML)
}

/// `?frame=N` serves a buffered frame; anything else (or an evicted N)
/// serves the newest one.
async fn frame_jpeg(query: Query<FrameQuery>, store: Data<PreviewStore>) -> HttpResponse {
    if let Some(packet) = query.frame.and_then(|n| store.find(n)) {
        return jpeg(packet);
    }
    let Some(latest) = store.latest() else {
        return HttpResponse::NoContent().finish();
    };
    let mut response = jpeg(latest.clone());
    if let Some(requested) = query.frame {
        let warning = format!(
            "299 npu-detect \"frame {requested} not buffered; returning latest {}\"",
            latest.frame_number
        );
        if let Ok(value) = header::HeaderValue::from_str(&warning) {
            response.headers_mut().insert(header::WARNING, value);
        }
    }
    response
}

async fn mjpeg_stream(store: Data<PreviewStore>) -> HttpResponse {
    let parts = stream! {
        let mut ticker = actix_web::rt::time::interval(MJPEG_POLL);
        let mut last_sent = None;
        loop {
            ticker.tick().await;
            let Some(packet) = store.latest() else { continue };
            if last_sent == Some(packet.frame_number) {
                continue;
            }
            last_sent = Some(packet.frame_number);

            let head = format!(
                "--{MJPEG_BOUNDARY}\r\nX-Sequence: {}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                packet.frame_number,
                packet.jpeg.len()
            );
            let mut part = Vec::with_capacity(head.len() + packet.jpeg.len() + 2);
            part.extend_from_slice(head.as_bytes());
            part.extend_from_slice(&packet.jpeg);
            part.extend_from_slice(b"\r\n");
            yield Ok::<Bytes, actix_web::Error>(Bytes::from(part));
        }
    };

    HttpResponse::Ok()
        .insert_header((header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"))
        .insert_header((header::CACHE_CONTROL, "no-cache"))
        .content_type(format!("multipart/x-mixed-replace; boundary={MJPEG_BOUNDARY}"))
        .streaming(parts)
}

async fn detections(store: Data<PreviewStore>) -> HttpResponse {
    match store.latest() {
        Some(packet) => HttpResponse::Ok().json(DetectionSnapshot::from(&packet)),
        None => HttpResponse::NoContent().finish(),
    }
}

async fn prometheus_metrics() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}
