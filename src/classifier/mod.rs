//! Intent classification — the external NLU service behind a trait.

pub mod http_backend;
pub mod intent;

use async_trait::async_trait;

use crate::context::ContextBundle;
use crate::error::ClassifierError;
pub use http_backend::HttpClassifier;
pub use intent::{Action, Classification};

/// One classification request: raw text plus the assembled context.
#[derive(Debug, Clone)]
pub struct ClassifyRequest<'a> {
    pub text: &'a str,
    pub context: &'a ContextBundle,
    /// Optional per-request model override from the inbound envelope.
    pub model: Option<&'a str>,
}

/// The external intent-classification service.
#[async_trait]
pub trait IntentClassifier: Send + Sync {
    async fn classify(
        &self,
        request: ClassifyRequest<'_>,
    ) -> Result<Classification, ClassifierError>;
}
