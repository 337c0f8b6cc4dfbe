//! User prompt collaborator

use async_trait::async_trait;
use zeroize::Zeroizing;

/// What to ask the user for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub label: String,
    /// Mask the input
    pub is_password: bool,
    /// Show a "remember" checkbox
    pub offer_remember: bool,
}

impl PromptRequest {
    pub fn secret(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            is_password: true,
            offer_remember: false,
        }
    }

    pub fn with_remember(mut self) -> Self {
        self.offer_remember = true;
        self
    }
}

/// The user's answer
pub struct PromptResponse {
    pub value: Zeroizing<String>,
    pub remember: bool,
}

impl PromptResponse {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            remember: false,
        }
    }

    pub fn remembered(value: impl Into<String>) -> Self {
        Self {
            value: Zeroizing::new(value.into()),
            remember: true,
        }
    }
}

impl std::fmt::Debug for PromptResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptResponse")
            .field("value", &"<redacted>")
            .field("remember", &self.remember)
            .finish()
    }
}

/// Modal prompt shown by the UI when a credential is missing.
///
/// Returns `None` when the user cancels.
#[async_trait]
pub trait PromptProvider: Send + Sync {
    async fn prompt_secret(&self, request: PromptRequest) -> Option<PromptResponse>;
}
