//! Secret handling
//!
//! The engine never owns persistent secrets. It talks to three
//! collaborators:
//! - a [`SecretStore`] that loads/saves/deletes passwords per profile key
//! - a [`PromptProvider`] that asks the user for missing secrets
//! - a [`CredentialCache`] holding short-lived secrets in memory only

mod cache;
mod keychain;
mod prompt;
mod store;

pub use cache::{CredentialCache, DEFAULT_TTL};
pub use keychain::KeyringSecretStore;
pub use prompt::{PromptProvider, PromptRequest, PromptResponse};
pub use store::{MemorySecretStore, SecretError, SecretStore};
