use http::StatusCode;
use log::{info, warn};
use quantum_chat_proto::{HEALTH_STATUS, HealthStatus, ROOT_MESSAGE, RootStatus};
use serde::de::DeserializeOwned;

use crate::net;

async fn probe<T: DeserializeOwned>(url: &str, prefer_ipv6: bool) -> anyhow::Result<T> {
    let resp = net::get(url, prefer_ipv6).await?;
    if resp.status() != StatusCode::OK {
        anyhow::bail!(
            "unexpected status [{}] {}",
            resp.status().as_u16(),
            String::from_utf8_lossy(resp.body())
        );
    }
    Ok(serde_json::from_slice(resp.body())?)
}

/// Checks both liveness endpoints, `base` is e.g. `http://localhost:8080`.
pub async fn check(base: &str, prefer_ipv6: bool) -> bool {
    let base = base.trim_end_matches('/');

    let root = match probe::<RootStatus>(&format!("{base}/"), prefer_ipv6).await {
        Ok(root) if root.message == ROOT_MESSAGE => true,
        Ok(root) => {
            warn!("GET / answered {:?}", root.message);
            false
        }
        Err(e) => {
            warn!("GET / failed: {e}");
            false
        }
    };

    let health = match probe::<HealthStatus>(&format!("{base}/health"), prefer_ipv6).await {
        Ok(health) if health.status == HEALTH_STATUS => true,
        Ok(health) => {
            warn!("GET /health answered {:?}", health.status);
            false
        }
        Err(e) => {
            warn!("GET /health failed: {e}");
            false
        }
    };

    info!("root: {root}, health: {health}");
    root && health
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    /// Serves `/` and `/health` with the given bodies, one request per connection.
    async fn fake_http(root: &'static str, health: &'static str) -> String {
        fake_http_with_status("200 OK", root, health).await
    }

    async fn fake_http_with_status(
        status: &'static str,
        root: &'static str,
        health: &'static str,
    ) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = vec![0u8; 1024];
                let n = sock.read(&mut buf).await.unwrap();
                let body = if buf[..n].starts_with(b"GET /health ") {
                    health
                } else {
                    root
                };
                let resp = format!(
                    "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                sock.write_all(resp.as_bytes()).await.unwrap();
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn healthy_server_passes() {
        let base = fake_http(
            r#"{"message":"Quantum Chat API is running"}"#,
            r#"{"status":"healthy"}"#,
        )
        .await;
        assert!(check(&base, false).await);
    }

    #[tokio::test]
    async fn wrong_body_fails() {
        let base = fake_http(
            r#"{"message":"Quantum Chat API is running"}"#,
            r#"{"status":"degraded"}"#,
        )
        .await;
        assert!(!check(&base, false).await);
    }

    #[tokio::test]
    async fn other_success_statuses_fail() {
        let base = fake_http_with_status(
            "202 Accepted",
            r#"{"message":"Quantum Chat API is running"}"#,
            r#"{"status":"healthy"}"#,
        )
        .await;
        assert!(!check(&base, false).await);
    }
}
