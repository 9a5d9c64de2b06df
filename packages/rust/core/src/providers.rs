//! Builds the model-backed services named by the configuration.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tramit_llm::{CompletionRequest, CompletionService, Embedder, HashingEmbedder, OpenAiCompatClient};
use tramit_shared::{AppConfig, EmbeddingProvider, LlmConfig, Result, TramitError};

/// The configured chat completion endpoint. Fails when its API key is unset.
pub fn completion_service(config: &LlmConfig) -> Result<Arc<dyn CompletionService>> {
    Ok(Arc::new(OpenAiCompatClient::from_config(config)?))
}

/// Like [`completion_service`], but a missing API key yields a service whose
/// every call fails, so commands that never ask the model still work offline.
pub fn completion_service_or_disabled(config: &LlmConfig) -> Arc<dyn CompletionService> {
    match completion_service(config) {
        Ok(service) => service,
        Err(e) => {
            debug!(error = %e, "completion service disabled");
            Arc::new(DisabledCompletion {
                reason: e.to_string(),
            })
        }
    }
}

/// The embedder selected by `[embeddings].provider`.
pub fn embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>> {
    match config.embeddings.provider {
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(
            config.embeddings.dimensions,
        )?)),
        EmbeddingProvider::Openai => Ok(Arc::new(
            OpenAiCompatClient::from_config(&config.llm)?.with_embeddings(&config.embeddings),
        )),
    }
}

/// Completion service standing in for one that could not be configured.
#[derive(Debug, Clone)]
pub struct DisabledCompletion {
    reason: String,
}

#[async_trait]
impl CompletionService for DisabledCompletion {
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        Err(TramitError::Completion(format!(
            "completion service unavailable: {}",
            self.reason
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn llm_without_key() -> LlmConfig {
        LlmConfig {
            api_key_env: "TRAMIT_PROVIDERS_TEST_UNSET_KEY".into(),
            ..LlmConfig::default()
        }
    }

    #[tokio::test]
    async fn missing_key_disables_completion() {
        assert!(completion_service(&llm_without_key()).is_err());

        let service = completion_service_or_disabled(&llm_without_key());
        let err = service
            .complete(&CompletionRequest::new("system", "user"))
            .await
            .unwrap_err();
        assert!(matches!(err, TramitError::Completion(_)));
        assert!(err.to_string().contains("API key not found"));
    }

    #[test]
    fn hashing_embedder_by_default() {
        let embedder = embedder(&AppConfig::default()).unwrap();
        assert_eq!(embedder.id(), "hashing-sha256:384");
    }

    #[test]
    fn remote_embedder_needs_key() {
        let mut config = AppConfig::default();
        config.llm = llm_without_key();
        config.embeddings.provider = EmbeddingProvider::Openai;
        assert!(embedder(&config).is_err());
    }
}
