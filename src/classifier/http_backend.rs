//! HTTP classifier client.
//!
//! Posts `{message, context, model}` to the classification endpoint and
//! normalizes whatever comes back. A timeout or transport failure surfaces
//! as a `ClassifierError` and leaves conversation state untouched upstream.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;
use tracing::{debug, warn};

use crate::classifier::intent::Classification;
use crate::classifier::{ClassifyRequest, IntentClassifier};
use crate::config::ClassifierConfig;
use crate::error::ClassifierError;

pub struct HttpClassifier {
    client: reqwest::Client,
    config: ClassifierConfig,
}

impl HttpClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl IntentClassifier for HttpClassifier {
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
    ) -> Result<Classification, ClassifierError> {
        let model = request.model.unwrap_or(&self.config.default_model);
        let body = json!({
            "message": request.text,
            "context": request.context,
            "model": model,
        });

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .timeout(self.config.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout(self.config.timeout)
                } else {
                    ClassifierError::RequestFailed(e.to_string())
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClassifierError::RequestFailed(e.to_string()))?;

        if !status.is_success() {
            warn!(%status, "Classifier returned error status");
            return Err(ClassifierError::RequestFailed(format!(
                "status {status}: {}",
                text.chars().take(200).collect::<String>()
            )));
        }

        let classification = Classification::parse(&text)?;
        debug!(
            action = %classification.raw_action,
            confidence = classification.confidence,
            "Classified inbound message"
        );
        Ok(classification)
    }
}
