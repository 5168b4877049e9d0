//! Chat model backends for Chatline.
//!
//! All backends implement the `chatline_core::ChatModel` trait.
//! [`build_model`] picks one from configuration.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatModel;

use chatline_config::ModelConfig;
use chatline_core::ChatModel;
use chatline_core::error::ModelError;
use std::sync::Arc;

/// Build the model backend named by `config.provider`.
///
/// Every supported provider speaks the OpenAI chat-completions protocol;
/// they differ only in endpoint and whether a key is required.
pub fn build_model(config: &ModelConfig) -> Result<Arc<dyn ChatModel>, ModelError> {
    let needs_key = match config.provider.as_str() {
        "openai" | "openrouter" | "custom" => true,
        "ollama" => false,
        other => {
            return Err(ModelError::NotConfigured(format!(
                "unknown provider '{other}' (expected openai, openrouter, ollama or custom)"
            )));
        }
    };

    let api_key = config.api_key.clone().unwrap_or_default();
    if needs_key && api_key.is_empty() {
        return Err(ModelError::NotConfigured(format!(
            "provider '{}' needs an API key (set model.api_key or CHATLINE_API_KEY)",
            config.provider
        )));
    }

    Ok(Arc::new(OpenAiCompatModel::from_config(config)?))
}
