use crate::chunking::{Chunker, ChunkingConfig};
use crate::conversation::{DEFAULT_HISTORY_TURNS, DEFAULT_MAX_CLIENTS};
use crate::error::{RagError, Result};
use crate::orchestrator::{CompletionSettings, DEFAULT_SYSTEM_PROMPT};
use crate::resilience::{CallPolicy, DEFAULT_CALL_TIMEOUT, DEFAULT_RETRY_BACKOFF};
use crate::traits::DEFAULT_EMBED_BATCH_SIZE;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    pub system_prompt: String,
    pub similarity_threshold: f32,
    pub top_k: usize,
    pub temperature: f32,
    pub max_tokens: u32,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub history_turns: usize,
    /// Clients whose history is kept; the least recently active is dropped.
    pub history_clients: usize,
    pub embedding: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub calls: CallConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            similarity_threshold: 0.7,
            top_k: 5,
            temperature: 0.7,
            max_tokens: 512,
            chunk_size: 512,
            chunk_overlap: 20,
            history_turns: DEFAULT_HISTORY_TURNS,
            history_clients: DEFAULT_MAX_CLIENTS,
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
            calls: CallConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub dimensions: usize,
    /// Chunks sent per `/embeddings` request during ingestion.
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080/v1".to_string(),
            model: "BAAI/bge-m3".to_string(),
            dimensions: 1024,
            batch_size: DEFAULT_EMBED_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationConfig {
    pub base_url: String,
    pub model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:60002/v1".to_string(),
            model: "default".to_string(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CallConfig {
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "timeout_ms")]
    pub timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    #[serde(rename = "retry_backoff_ms")]
    pub retry_backoff: Duration,
    pub max_retries: u32,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retries: 1,
        }
    }
}

impl ServiceConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml_ng::from_str(yaml)
            .map_err(|error| RagError::InvalidConfiguration(format!("invalid config: {error}")))
    }

    /// Reads and validates `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(contents) => {
                info!(path = %path.display(), "loaded configuration");
                Self::from_yaml_str(&contents)?
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            Err(error) => return Err(error.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.chunking().validate()?;

        if self.top_k == 0 {
            return Err(invalid("top_k must be greater than zero"));
        }
        if !self.similarity_threshold.is_finite() {
            return Err(invalid("similarity_threshold must be finite"));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(invalid("temperature must be a non-negative number"));
        }
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens must be greater than zero"));
        }
        if self.embedding.dimensions == 0 {
            return Err(invalid("embedding.dimensions must be greater than zero"));
        }
        if self.embedding.batch_size == 0 {
            return Err(invalid("embedding.batch_size must be greater than zero"));
        }
        if self.history_clients == 0 {
            return Err(invalid("history_clients must be greater than zero"));
        }
        if self.calls.timeout.is_zero() {
            return Err(invalid("calls.timeout_ms must be greater than zero"));
        }
        parse_base_url("embedding.base_url", &self.embedding.base_url)?;
        parse_base_url("generation.base_url", &self.generation.base_url)?;
        Ok(())
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
        }
    }

    pub fn chunker(&self) -> Result<Chunker> {
        Chunker::try_from(self.chunking())
    }

    pub fn call_policy(&self) -> CallPolicy {
        CallPolicy::new(
            self.calls.timeout,
            self.calls.retry_backoff,
            self.calls.max_retries,
        )
    }

    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            system_prompt: self.system_prompt.clone(),
            similarity_threshold: self.similarity_threshold,
            top_k: self.top_k,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            history_turns: self.history_turns,
            history_clients: self.history_clients,
        }
    }
}

fn invalid(message: &str) -> RagError {
    RagError::InvalidConfiguration(message.to_string())
}

pub(crate) fn parse_base_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|error| RagError::InvalidConfiguration(format!("{field} `{value}`: {error}")))?;
    if url.cannot_be_a_base() {
        return Err(RagError::InvalidConfiguration(format!(
            "{field} `{value}` cannot be used as a base URL"
        )));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = ServiceConfig::default();
        config.validate().unwrap();
        assert_eq!(config.top_k, 5);
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.chunk_overlap, 20);
        assert_eq!(config.embedding.batch_size, 32);
        assert_eq!(config.history_clients, 1024);
        assert_eq!(config.call_policy(), CallPolicy::default());
    }

    #[test]
    fn partial_yaml_keeps_remaining_defaults() {
        let config = ServiceConfig::from_yaml_str(
            "system_prompt: Answer tersely.\n\
             top_k: 3\n\
             embedding:\n  batch_size: 8\n\
             generation:\n  model: llama\n\
             calls:\n  timeout_ms: 1500\n",
        )
        .unwrap();

        assert_eq!(config.system_prompt, "Answer tersely.");
        assert_eq!(config.top_k, 3);
        assert_eq!(config.generation.model, "llama");
        assert_eq!(config.embedding.batch_size, 8);
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.generation.base_url, "http://127.0.0.1:60002/v1");
        assert_eq!(config.calls.timeout, Duration::from_millis(1500));
        assert_eq!(config.calls.retry_backoff, DEFAULT_RETRY_BACKOFF);
        assert_eq!(config.similarity_threshold, 0.7);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let error = ServiceConfig::from_yaml_str("top_kk: 3\n").unwrap_err();
        assert!(matches!(error, RagError::InvalidConfiguration(_)));
    }

    #[test]
    fn validation_catches_bad_values() {
        let cases = [
            ServiceConfig {
                chunk_overlap: 512,
                ..ServiceConfig::default()
            },
            ServiceConfig {
                top_k: 0,
                ..ServiceConfig::default()
            },
            ServiceConfig {
                temperature: -0.1,
                ..ServiceConfig::default()
            },
            ServiceConfig {
                max_tokens: 0,
                ..ServiceConfig::default()
            },
            ServiceConfig {
                embedding: EmbeddingConfig {
                    base_url: "not a url".to_string(),
                    ..EmbeddingConfig::default()
                },
                ..ServiceConfig::default()
            },
            ServiceConfig {
                embedding: EmbeddingConfig {
                    batch_size: 0,
                    ..EmbeddingConfig::default()
                },
                ..ServiceConfig::default()
            },
            ServiceConfig {
                history_clients: 0,
                ..ServiceConfig::default()
            },
            ServiceConfig {
                calls: CallConfig {
                    timeout: Duration::ZERO,
                    ..CallConfig::default()
                },
                ..ServiceConfig::default()
            },
        ];

        for config in cases {
            let error = config.validate().unwrap_err();
            assert!(matches!(error, RagError::InvalidConfiguration(_)), "{config:?}");
        }
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = ServiceConfig::load(&dir.path().join("config.yaml"))?;
        assert_eq!(config, ServiceConfig::default());
        Ok(())
    }

    #[test]
    fn invalid_file_fails_at_load() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "chunk_size: 10\nchunk_overlap: 10\n")?;

        let error = ServiceConfig::load(&path).unwrap_err();
        assert!(matches!(error, RagError::InvalidConfiguration(_)));
        Ok(())
    }
}
