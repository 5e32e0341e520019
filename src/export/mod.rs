pub mod api;
pub mod health;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serves the metrics and API router until stopped.
pub struct HttpServer {
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
}

impl HttpServer {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
        }
    }

    /// Bind and start serving in the background. Returns the bound address.
    pub async fn start(&self, app: Router) -> Result<SocketAddr> {
        let bind_addr = bind_addr(&self.addr);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "http server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "http server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expand the ":port" shorthand to all interfaces.
pub fn bind_addr(addr: &str) -> String {
    let addr = if addr.is_empty() { ":9090" } else { addr };

    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_addr_shorthand() {
        assert_eq!(bind_addr(":9090"), "0.0.0.0:9090");
        assert_eq!(bind_addr(""), "0.0.0.0:9090");
        assert_eq!(bind_addr("127.0.0.1:8080"), "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_server_serves_and_stops() {
        let server = HttpServer::new("127.0.0.1:0");
        let app = Router::new().route("/healthz", axum::routing::get(|| async { "ok" }));
        let addr = server.start(app).await.expect("start");
        assert_ne!(addr.port(), 0);

        tokio::net::TcpStream::connect(addr).await.expect("connect");

        server.stop().await.expect("stop");
    }
}
