//! Session credential lifecycle.
//!
//! This module provides:
//! - `CredentialManager`: login, logout, server-side revocation and restore
//!   of the single current session
//! - `SecretStore`: where tokens live (`KeyringSecretStore` for the OS
//!   keychain, `MemorySecretStore` for tests)
//!
//! Only the non-secret `Identity` is ever written to the snapshot.

pub mod credentials;
pub mod session;

pub use credentials::{KeyringSecretStore, MemorySecretStore, SecretStore};
pub use session::{Credential, CredentialManager, Identity, PushRegistration};
