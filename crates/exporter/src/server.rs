//! HTTP scrape endpoint.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::header::CONTENT_TYPE;
use hyper::{
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::orchestrator::{ScrapeHandler, ScrapeResponse};
use crate::{ExporterError, ExporterResult};

pub const METRICS_PATH: &str = "/metrics";

/// Binds `addr` and serves scrapes until `shutdown` completes. Returns the
/// bound address and the server task.
pub fn spawn<F>(
    addr: SocketAddr,
    handler: Arc<dyn ScrapeHandler>,
    shutdown: F,
) -> ExporterResult<(SocketAddr, JoinHandle<ExporterResult<()>>)>
where
    F: Future<Output = ()> + Send + 'static,
{
    let make_svc = make_service_fn(move |_conn| {
        let handler = handler.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let handler = handler.clone();
                async move { handle_request(req, handler).await }
            }))
        }
    });

    let server = Server::try_bind(&addr)
        .map_err(|e| ExporterError::server(format!("cannot bind {addr}: {e}")))?
        .serve(make_svc);
    let local = server.local_addr();
    info!(address = %local, path = METRICS_PATH, "scrape endpoint listening");

    let task = tokio::spawn(async move {
        server.with_graceful_shutdown(shutdown).await?;
        Ok(())
    });
    Ok((local, task))
}

/// Serves scrapes on `port` on all interfaces until `shutdown` completes.
pub async fn serve<F>(port: u16, handler: Arc<dyn ScrapeHandler>, shutdown: F) -> ExporterResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let (_, task) = spawn(addr, handler, shutdown)?;
    task.await
        .map_err(|e| ExporterError::server(format!("scrape server task failed: {e}")))?
}

async fn handle_request(
    req: Request<Body>,
    handler: Arc<dyn ScrapeHandler>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, METRICS_PATH) => {
            let response = match handler.on_scrape_request().await {
                ScrapeResponse::Metrics { content_type, body } => {
                    let mut resp = Response::new(Body::from(body));
                    if let Ok(value) = content_type.parse() {
                        resp.headers_mut().insert(CONTENT_TYPE, value);
                    }
                    resp
                }
                ScrapeResponse::ServiceUnavailable => {
                    let mut resp = Response::new(Body::empty());
                    *resp.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
                    resp
                }
            };
            debug!(status = %response.status(), "scrape served");
            Ok(response)
        }
        _ => {
            let mut not_found = Response::new(Body::from("not found"));
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hyper::Client;

    struct Fixed(ScrapeResponse);

    #[async_trait]
    impl ScrapeHandler for Fixed {
        async fn on_scrape_request(&self) -> ScrapeResponse {
            self.0.clone()
        }
    }

    async fn get(addr: SocketAddr, path: &str) -> (StatusCode, Option<String>, String) {
        let uri = format!("http://{addr}{path}").parse().unwrap();
        let resp = Client::new().get(uri).await.unwrap();
        let status = resp.status();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .map(|v| v.to_str().unwrap().to_string());
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    fn start(response: ScrapeResponse) -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let (addr, _task) = spawn(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            Arc::new(Fixed(response)),
            async move {
                let _ = rx.await;
            },
        )
        .unwrap();
        (addr, tx)
    }

    #[tokio::test]
    async fn test_metrics_ok() {
        let (addr, _stop) = start(ScrapeResponse::Metrics {
            content_type: "text/plain; version=0.0.4".to_string(),
            body: b"qdmetrics_linkCount{router=\"R1\"} 4\n".to_vec(),
        });

        let (status, content_type, body) = get(addr, METRICS_PATH).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(content_type.as_deref(), Some("text/plain; version=0.0.4"));
        assert!(body.contains("qdmetrics_linkCount"));
    }

    #[tokio::test]
    async fn test_unavailable_is_503() {
        let (addr, _stop) = start(ScrapeResponse::ServiceUnavailable);
        let (status, _, body) = get(addr, METRICS_PATH).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_other_paths_are_404() {
        let (addr, _stop) = start(ScrapeResponse::ServiceUnavailable);
        let (status, _, _) = get(addr, "/healthz").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
