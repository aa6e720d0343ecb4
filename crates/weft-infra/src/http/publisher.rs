//! CloudEvent sink that POSTs each event to an HTTP endpoint in structured
//! content mode (`application/cloudevents+json`).

use std::time::Duration;

use weft_core::repository::CloudEventPublisher;
use weft_types::error::RepositoryError;
use weft_types::event::CloudEvent;

const CONTENT_TYPE: &str = "application/cloudevents+json";

/// Publishes CloudEvents to a single HTTP endpoint.
pub struct HttpCloudEventPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCloudEventPublisher {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("weft/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl CloudEventPublisher for HttpCloudEventPublisher {
    async fn publish(&self, event: &CloudEvent) -> Result<(), RepositoryError> {
        let body = serde_json::to_vec(event)
            .map_err(|e| RepositoryError::Query(format!("failed to serialize event: {e}")))?;
        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, CONTENT_TYPE)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                tracing::debug!(endpoint = %self.endpoint, error = %e, "event delivery failed");
                RepositoryError::Connection
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RepositoryError::Query(format!(
                "event sink {} answered {status}",
                self.endpoint
            )));
        }
        tracing::debug!(endpoint = %self.endpoint, event_type = %event.type_, "event delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Accept one request, answer with `status_line`, and return the raw request.
    async fn serve_once(status_line: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/events", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                received.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(split) = text.find("\r\n\r\n") {
                    let length = text[..split]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= split + 4 + length {
                        break;
                    }
                }
            }
            let response = format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (url, handle)
    }

    #[tokio::test]
    async fn test_publish_posts_structured_event() {
        let (url, server) = serve_once("HTTP/1.1 202 Accepted").await;
        let publisher = HttpCloudEventPublisher::new(url).unwrap();
        let event = CloudEvent::new("https://weft.dev", "com.example.shipped")
            .with_data(json!({"order": "A-1"}));

        publisher.publish(&event).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("POST /events"));
        assert!(request.to_lowercase().contains("content-type: application/cloudevents+json"));
        assert!(request.contains(r#""type":"com.example.shipped""#));
        assert!(request.contains(r#""order":"A-1""#));
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let (url, server) = serve_once("HTTP/1.1 500 Internal Server Error").await;
        let publisher = HttpCloudEventPublisher::new(url).unwrap();
        let event = CloudEvent::new("https://weft.dev", "com.example.failed");

        let err = publisher.publish(&event).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Query(msg) if msg.contains("500")));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/events", listener.local_addr().unwrap());
        drop(listener);

        let publisher = HttpCloudEventPublisher::new(url).unwrap();
        let event = CloudEvent::new("https://weft.dev", "com.example.lost");
        assert_eq!(publisher.publish(&event).await, Err(RepositoryError::Connection));
    }
}
