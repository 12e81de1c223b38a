use ditch_config::{DitchConfig, Provider};
use ditch_core::{CompletionClient, Result};
use std::sync::Arc;
use tracing::info;

mod bedrock;
mod openai;

pub use bedrock::BedrockCompletionClient;
pub use openai::OpenAiClient;

/// Build the completion client selected by `model.provider`.
pub async fn build_client(config: &DitchConfig) -> Result<Arc<dyn CompletionClient>> {
    let client: Arc<dyn CompletionClient> = match config.model.provider {
        Provider::OpenAi => {
            info!("Using OpenAI-compatible endpoint at {}", config.openai.base_url);
            Arc::new(OpenAiClient::new(&config.openai)?)
        }
        Provider::Bedrock => {
            let client = BedrockCompletionClient::new(&config.aws).await?;
            info!("Using AWS Bedrock in region {}", client.get_region());
            Arc::new(client)
        }
    };

    Ok(client)
}
