use super::{endpoint, error_detail};
use crate::config::EmbeddingConfig;
use crate::error::{RagError, Result};
use crate::traits::Embedder;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

/// Client for any server exposing the OpenAI `/embeddings` route.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    url: Url,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    batch_size: usize,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            url: endpoint("embedding.base_url", &config.base_url, "embeddings")?,
            api_key: api_key.filter(|key| !key.is_empty()),
            model: config.model.clone(),
            dimensions: config.dimensions,
            batch_size: config.batch_size,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: Option<usize>,
    embedding: Vec<f32>,
}

/// Orders vectors by the server's `index` field and checks their size.
fn collect_vectors(
    response: EmbeddingResponse,
    expected_count: usize,
    dimensions: usize,
) -> Result<Vec<Vec<f32>>> {
    let mut data = response.data;
    if data.len() != expected_count {
        return Err(RagError::EmbeddingUnavailable(format!(
            "expected {expected_count} embeddings, server returned {}",
            data.len()
        )));
    }
    data.sort_by_key(|item| item.index.unwrap_or(usize::MAX));

    data.into_iter()
        .map(|item| {
            if item.embedding.len() != dimensions {
                return Err(RagError::DimensionMismatch {
                    expected: dimensions,
                    actual: item.embedding.len(),
                });
            }
            Ok(item.embedding)
        })
        .collect()
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::EmbeddingUnavailable("server returned no embedding".to_string()))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(batch_size = texts.len(), model = %self.model, "requesting embeddings");

        let mut request = self.client.post(self.url.clone()).json(&EmbeddingRequest {
            model: &self.model,
            input: texts,
        });
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            error!(error = %error, url = %self.url, "embedding request failed");
            RagError::EmbeddingUnavailable(format!("request failed: {error}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, "embedding server returned an error");
            return Err(RagError::EmbeddingUnavailable(format!(
                "server returned {status}: {}",
                error_detail(body)
            )));
        }

        let parsed: EmbeddingResponse = response.json().await.map_err(|error| {
            RagError::EmbeddingUnavailable(format!("unreadable embedding response: {error}"))
        })?;
        collect_vectors(parsed, texts.len(), self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(body: &str) -> EmbeddingResponse {
        serde_json::from_str(body).unwrap()
    }

    #[test]
    fn vectors_follow_server_index_order() {
        let response = parse(
            r#"{"data":[
                {"index":1,"embedding":[0.0,1.0]},
                {"index":0,"embedding":[1.0,0.0]}
            ],"model":"bge"}"#,
        );
        let vectors = collect_vectors(response, 2, 2).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn wrong_width_is_a_dimension_mismatch() {
        let response = parse(r#"{"data":[{"embedding":[1.0,0.0,0.0]}]}"#);
        let error = collect_vectors(response, 1, 2).unwrap_err();
        assert!(matches!(error, RagError::DimensionMismatch { expected: 2, actual: 3 }));
    }

    #[test]
    fn missing_vectors_are_reported() {
        let response = parse(r#"{"data":[]}"#);
        let error = collect_vectors(response, 2, 2).unwrap_err();
        assert!(matches!(error, RagError::EmbeddingUnavailable(_)));
    }

    #[test]
    fn empty_api_key_is_ignored() {
        let embedder = OpenAiEmbedder::new(&EmbeddingConfig::default(), Some(String::new())).unwrap();
        assert!(embedder.api_key.is_none());
        assert_eq!(embedder.url().as_str(), "http://127.0.0.1:8080/v1/embeddings");
        assert_eq!(embedder.dimensions(), 1024);
        assert_eq!(embedder.max_batch_size(), 32);
    }

    #[tokio::test]
    async fn unreachable_server_is_embedding_unavailable() {
        let config = EmbeddingConfig {
            base_url: "http://127.0.0.1:9/v1".to_string(),
            ..EmbeddingConfig::default()
        };
        let embedder = OpenAiEmbedder::new(&config, None).unwrap();
        let error = embedder.embed("hello").await.unwrap_err();
        assert!(matches!(error, RagError::EmbeddingUnavailable(_)));
        assert!(error.is_transient());
    }
}
