use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{ClientError, EmbeddingProvider, ImageRewriter, RewriteRequest};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 512;

fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

fn map_send_error(err: reqwest::Error, timeout: Duration) -> ClientError {
    if err.is_timeout() {
        ClientError::Timeout(timeout)
    } else {
        ClientError::Transport(err.to_string())
    }
}

/// Sends the request and decodes a 2xx JSON body; anything else is an error.
async fn post_json<T: for<'de> Deserialize<'de>>(
    client: &reqwest::Client,
    url: &str,
    body: &serde_json::Value,
    timeout: Duration,
) -> Result<T, ClientError> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| map_send_error(e, timeout))?;

    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()));
    }

    let body = response.text().await.unwrap_or_default();
    let body = match body.char_indices().nth(MAX_ERROR_BODY) {
        Some((idx, _)) => body[..idx].to_string(),
        None => body,
    };
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Embedding service: `POST {endpoint}` with `{"image_url"}`, answers
/// `{"embedding": [f32]}`.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpEmbeddingClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            client: build_client(timeout),
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    async fn embed_image(&self, source_url: &str) -> Result<Vec<f32>, ClientError> {
        let response: EmbeddingResponse = post_json(
            &self.client,
            &self.endpoint,
            &json!({ "image_url": source_url }),
            self.timeout,
        )
        .await?;
        if response.embedding.is_empty() {
            return Err(ClientError::Decode("empty embedding".to_string()));
        }
        Ok(response.embedding)
    }
}

/// Sanitizer service: `POST {endpoint}` with the rewrite request, answers
/// `{"url": "..."}`.
#[derive(Debug, Clone)]
pub struct HttpImageRewriter {
    endpoint: String,
    timeout: Duration,
    client: reqwest::Client,
}

impl HttpImageRewriter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_timeout(endpoint, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout,
            client: build_client(timeout),
        }
    }
}

#[derive(Deserialize)]
struct RewriteResponse {
    url: String,
}

#[async_trait]
impl ImageRewriter for HttpImageRewriter {
    async fn rewrite(&self, request: &RewriteRequest) -> Result<String, ClientError> {
        let body = serde_json::to_value(request).map_err(|e| ClientError::Decode(e.to_string()))?;
        let response: RewriteResponse =
            post_json(&self.client, &self.endpoint, &body, self.timeout).await?;
        if response.url.trim().is_empty() {
            return Err(ClientError::Decode("empty url".to_string()));
        }
        Ok(response.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use mediarun_core::ItemId;

    async fn spawn_server(status: StatusCode, body: serde_json::Value) -> String {
        let app = Router::new().route(
            "/call",
            post(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        format!("http://{addr}/call")
    }

    #[tokio::test]
    async fn embedding_success() {
        let url = spawn_server(StatusCode::OK, json!({ "embedding": [0.5, 1.5] })).await;
        let client = HttpEmbeddingClient::new(url);
        assert_eq!(client.embed_image("https://img/1.jpg").await.unwrap(), vec![0.5, 1.5]);
    }

    #[tokio::test]
    async fn non_2xx_is_status_error() {
        let url = spawn_server(StatusCode::SERVICE_UNAVAILABLE, json!({ "message": "busy" })).await;
        let client = HttpEmbeddingClient::new(url);
        let err = client.embed_image("https://img/1.jpg").await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn unexpected_body_is_decode_error() {
        let url = spawn_server(StatusCode::OK, json!({ "nope": true })).await;
        let rewriter = HttpImageRewriter::new(url);
        let request = RewriteRequest {
            item_id: ItemId::new(1),
            source_url: "https://img/1.jpg".into(),
            subject: "acme".into(),
        };
        assert!(matches!(
            rewriter.rewrite(&request).await,
            Err(ClientError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_transport_error() {
        let client = HttpEmbeddingClient::with_timeout("http://127.0.0.1:9/unreachable", Duration::from_secs(2));
        assert!(matches!(
            client.embed_image("https://img/1.jpg").await,
            Err(ClientError::Transport(_)) | Err(ClientError::Timeout(_))
        ));
    }
}
