pub mod openai_chat;
pub mod openai_embeddings;

pub use openai_chat::{build_messages, ChatMessage, OpenAiChatGenerator};
pub use openai_embeddings::OpenAiEmbedder;

use crate::config::parse_base_url;
use crate::error::{RagError, Result};
use serde::Deserialize;
use url::Url;

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

/// Resolves `path` below `base_url`, keeping any path prefix such as `/v1`.
pub(crate) fn endpoint(field: &str, base_url: &str, path: &str) -> Result<Url> {
    let mut base = parse_base_url(field, base_url)?;
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path).map_err(|error| {
        RagError::InvalidConfiguration(format!("{field} `{base_url}`: {error}"))
    })
}

/// Pulls the provider's message out of an error body, falling back to the raw text.
pub(crate) fn error_detail(body: String) -> String {
    serde_json::from_str::<ErrorResponse>(&body)
        .map(|response| response.error.message)
        .unwrap_or(body)
}
