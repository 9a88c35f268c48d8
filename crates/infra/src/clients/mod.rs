//! Remote media services, invoked once per item.

mod http;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use mediarun_batch::ItemError;
use mediarun_core::ItemId;

pub use http::{HttpEmbeddingClient, HttpImageRewriter};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Any non-2xx response.
    #[error("remote returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid response body: {0}")]
    Decode(String),
}

impl From<ClientError> for ItemError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Status { status, body } => ItemError::remote(status, body),
            ClientError::Transport(msg) => ItemError::Transport(msg),
            ClientError::Timeout(after) => ItemError::Timeout(after),
            ClientError::Decode(msg) => ItemError::malformed(msg),
        }
    }
}

/// Computes an embedding vector for an image.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed_image(&self, source_url: &str) -> Result<Vec<f32>, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RewriteRequest {
    pub item_id: ItemId,
    pub source_url: String,
    pub subject: String,
}

/// Produces a sanitized copy of an image and returns its new location.
#[async_trait]
pub trait ImageRewriter: Send + Sync {
    async fn rewrite(&self, request: &RewriteRequest) -> Result<String, ClientError>;
}
