use crate::config::Config;
use crate::error::{ConfigError, ServiceError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

const SERVICE: &str = "Embedding service";

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError>;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// Accepts both the bare `{"embedding": [...]}` shape and the
/// OpenAI-style `{"data": [{"embedding": [...]}]}` shape.
#[derive(Deserialize)]
#[serde(untagged)]
enum EmbedResponse {
    Single { embedding: Vec<f32> },
    Batch { data: Vec<EmbeddingItem> },
}

impl EmbedResponse {
    fn into_vector(self) -> Option<Vec<f32>> {
        match self {
            EmbedResponse::Single { embedding } => Some(embedding),
            EmbedResponse::Batch { data } => data.into_iter().next().map(|item| item.embedding),
        }
        .filter(|v| !v.is_empty())
    }
}

/// Embedding service reached over HTTP.
#[derive(Clone)]
pub struct HttpEmbedder {
    client: Client,
    url: String,
    timeout_secs: u64,
}

impl HttpEmbedder {
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let url = config.require_embedding_url()?;
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| ConfigError::Invalid {
                field: "embedding_url",
                reason: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: url.to_string(),
            timeout_secs: config.request_timeout().as_secs(),
        })
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, ServiceError> {
        debug!(url = %self.url, bytes = text.len(), "Requesting embedding");

        let response = self
            .client
            .post(&self.url)
            .json(&EmbedRequest { input: text })
            .send()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, self.timeout_secs, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ServiceError::Status {
                service: SERVICE,
                status: status.as_u16(),
                body,
            });
        }

        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| ServiceError::from_reqwest(SERVICE, self.timeout_secs, e))?;

        body.into_vector().ok_or(ServiceError::Decode {
            service: SERVICE,
            reason: "empty embedding".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_both_response_shapes() {
        let single: EmbedResponse = serde_json::from_str(r#"{"embedding":[0.1,0.2]}"#).unwrap();
        assert_eq!(single.into_vector(), Some(vec![0.1, 0.2]));

        let batch: EmbedResponse =
            serde_json::from_str(r#"{"data":[{"embedding":[1.0]},{"embedding":[2.0]}]}"#).unwrap();
        assert_eq!(batch.into_vector(), Some(vec![1.0]));
    }

    #[test]
    fn test_empty_embedding_is_rejected() {
        let empty: EmbedResponse = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert_eq!(empty.into_vector(), None);
    }

    #[test]
    fn test_missing_url_is_config_error() {
        let err = HttpEmbedder::from_config(&Config::new()).err().unwrap();
        assert_eq!(err, ConfigError::Missing(crate::config::ENV_EMBEDDING_URL));
    }
}
