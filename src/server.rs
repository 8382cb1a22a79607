use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::api;
use crate::miner::Miner;

/// Longest command the API server reads.
const MAX_COMMAND: usize = 4096;

/// How long a client may take to send its request and read the reply.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, so fd exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts the next connection. Errors are logged and retried; they never end
/// the listener.
async fn accept(listener: &TcpListener, name: &str) -> (TcpStream, SocketAddr) {
    loop {
        match listener.accept().await {
            Ok(conn) => return conn,
            Err(e) => {
                tracing::warn!(server = name, error = %e, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Admin API listener: one command per connection.
pub struct ApiServer {
    miner: Arc<Miner>,
    listener: TcpListener,
    client_timeout: Duration,
}

impl ApiServer {
    /// Binds loopback only, unless `network` is set.
    pub async fn bind(miner: Arc<Miner>, port: u16, network: bool) -> std::io::Result<Self> {
        let host = if network { "0.0.0.0" } else { "127.0.0.1" };
        let listener = TcpListener::bind((host, port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "API listening");
        Ok(Self {
            miner,
            listener,
            client_timeout: CLIENT_TIMEOUT,
        })
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serves connections until the task is dropped.
    pub async fn serve(self) {
        loop {
            let (socket, peer) = accept(&self.listener, "api").await;
            let miner = Arc::clone(&self.miner);
            let limit = self.client_timeout;
            tokio::spawn(async move {
                match tokio::time::timeout(limit, Self::handle(socket, &miner)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::debug!(%peer, error = %e, "API connection failed"),
                    Err(_) => tracing::debug!(%peer, "API client timed out"),
                }
            });
        }
    }

    async fn handle(mut socket: TcpStream, miner: &Miner) -> std::io::Result<()> {
        let mut buf = vec![0u8; MAX_COMMAND];
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let command = String::from_utf8_lossy(&buf[..n]);
        let reply = api::dispatch(miner, &command);
        socket.write_all(reply.as_bytes()).await?;
        socket.shutdown().await
    }
}

/// HTTP endpoint for `/metrics` (Prometheus text) and `/health` (JSON).
pub struct MetricsServer {
    miner: Arc<Miner>,
    listener: TcpListener,
    client_timeout: Duration,
}

impl MetricsServer {
    pub async fn bind(miner: Arc<Miner>, port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(addr = %listener.local_addr()?, "metrics listening");
        Ok(Self {
            miner,
            listener,
            client_timeout: CLIENT_TIMEOUT,
        })
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn serve(self) {
        loop {
            let (socket, peer) = accept(&self.listener, "metrics").await;
            let miner = Arc::clone(&self.miner);
            let limit = self.client_timeout;

            tokio::spawn(async move {
                if tokio::time::timeout(limit, Self::handle(socket, &miner)).await.is_err() {
                    tracing::debug!(%peer, "metrics client timed out");
                }
            });
        }
    }

    async fn handle(mut socket: TcpStream, miner: &Miner) {
        let mut buffer = [0; 1024];
        let n = match socket.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        let request = String::from_utf8_lossy(&buffer[..n]);
        let response = Self::handle_request(&request, miner);
        let _ = socket.write_all(response.as_bytes()).await;
    }

    fn handle_request(request: &str, miner: &Miner) -> String {
        let mut parts = request.lines().next().unwrap_or_default().split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return Self::error_response(400, "Bad Request");
        };

        match (method, path) {
            ("GET", "/metrics") => match miner.export_metrics() {
                Ok(text) => Self::response(200, "OK", "text/plain; version=0.0.4", &text),
                Err(_) => Self::error_response(500, "Internal Server Error"),
            },
            ("GET", "/health") => match serde_json::to_string(&miner.health()) {
                Ok(json) => Self::response(200, "OK", "application/json", &json),
                Err(_) => Self::error_response(500, "Internal Server Error"),
            },
            _ => Self::error_response(404, "Not Found"),
        }
    }

    fn response(status: u16, reason: &str, content_type: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn error_response(status: u16, message: &str) -> String {
        let body = format!("{{\"error\": \"{message}\"}}");
        Self::response(status, message, "application/json", &body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DeviceDriver;
    use crate::test_utils::{test_config, MockDriver, MockSource};

    fn miner() -> Arc<Miner> {
        let driver: Arc<dyn DeviceDriver> = Arc::new(MockDriver::new(1));
        Arc::new(Miner::new(test_config(1), Arc::new(MockSource::default()), vec![driver]).unwrap())
    }

    #[test]
    fn routes_metrics_and_health() {
        let m = miner();
        let metrics = MetricsServer::handle_request("GET /metrics HTTP/1.1\r\n\r\n", &m);
        assert!(metrics.starts_with("HTTP/1.1 200"));
        assert!(metrics.contains("hashmill_accepted_total"));

        let health = MetricsServer::handle_request("GET /health HTTP/1.1\r\n\r\n", &m);
        assert!(health.contains("\"status\""));

        assert!(MetricsServer::handle_request("GET /nope HTTP/1.1\r\n\r\n", &m).starts_with("HTTP/1.1 404"));
        assert!(MetricsServer::handle_request("", &m).starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn api_round_trip_over_tcp() {
        let server = ApiServer::bind(miner(), 0, false).await.unwrap();
        let port = server.local_addr().unwrap().port();
        tokio::spawn(server.serve());

        let raw = api::request("127.0.0.1", port, "devcount", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        let records = api::parse_reply(&raw);
        assert_eq!(records[0].get("STATUS"), Some("S"));
        assert_eq!(records[1].get("Count"), Some("1"));

        let raw = api::request("127.0.0.1", port, "bogus", std::time::Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(api::parse_reply(&raw)[0].get("STATUS"), Some("E"));
    }

    async fn read_to_close(port: u16) -> Vec<u8> {
        let mut idle = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), idle.read_to_end(&mut rest))
            .await
            .expect("server kept an idle client open")
            .unwrap();
        rest
    }

    #[tokio::test]
    async fn idle_clients_are_cut_off() {
        let api = ApiServer::bind(miner(), 0, false)
            .await
            .unwrap()
            .with_client_timeout(Duration::from_millis(50));
        let api_port = api.local_addr().unwrap().port();
        tokio::spawn(api.serve());

        let metrics = MetricsServer::bind(miner(), 0)
            .await
            .unwrap()
            .with_client_timeout(Duration::from_millis(50));
        let metrics_port = metrics.local_addr().unwrap().port();
        tokio::spawn(metrics.serve());

        assert!(read_to_close(api_port).await.is_empty());
        assert!(read_to_close(metrics_port).await.is_empty());

        // the listener keeps serving after a timed-out client
        let raw = api::request("127.0.0.1", api_port, "devcount", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(api::parse_reply(&raw)[0].get("STATUS"), Some("S"));
    }
}
