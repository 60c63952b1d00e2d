//! Definition source backed by the bot store's HTTP API.
//!
//! - `GET <base>/bots/<id>`: one definition, 404 if absent
//! - `GET <base>/bots?status=active`: the definitions to recover

use crate::error::StartupError;
use async_trait::async_trait;
use botwright_core::BotId;
use botwright_flow::{BotDefinition, DesiredStatus};
use botwright_runtime::{DefinitionSource, SourceError};
use reqwest::StatusCode;
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Fetches definitions over HTTP.
pub struct HttpDefinitionSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDefinitionSource {
    /// Creates a source rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> botwright_core::Result<Self, StartupError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| StartupError::DefinitionSource {
                details: e.to_string(),
            })?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::RequestFailed {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl DefinitionSource for HttpDefinitionSource {
    async fn get_bot_definition(&self, bot_id: &BotId) -> Result<BotDefinition, SourceError> {
        let response = self.get(&format!("{}/bots/{bot_id}", self.base_url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound {
                bot_id: bot_id.clone(),
            });
        }

        response
            .error_for_status()
            .map_err(|e| SourceError::RequestFailed {
                message: e.to_string(),
            })?
            .json::<BotDefinition>()
            .await
            .map_err(|e| SourceError::Malformed {
                message: e.to_string(),
            })
    }

    async fn list_active_definitions(&self) -> Result<Vec<BotDefinition>, SourceError> {
        let documents = self
            .get(&format!("{}/bots?status=active", self.base_url))
            .await?
            .error_for_status()
            .map_err(|e| SourceError::RequestFailed {
                message: e.to_string(),
            })?
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| SourceError::Malformed {
                message: e.to_string(),
            })?;

        // One unreadable document must not hide the others. The store may
        // also ignore the status filter, so it is applied again here.
        let mut definitions = Vec::with_capacity(documents.len());
        for document in documents {
            match serde_json::from_value::<BotDefinition>(document) {
                Ok(definition) if definition.desired_status == DesiredStatus::Active => {
                    definitions.push(definition);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "skipping unreadable bot definition");
                }
            }
        }
        Ok(definitions)
    }
}
