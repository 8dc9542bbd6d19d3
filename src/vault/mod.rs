// Encrypted storage and transparent refresh of OAuth credentials
pub mod cipher;
pub mod token_vault;

pub use cipher::TokenCipher;
pub use token_vault::{Credential, TokenVault, TokenVaultConfig};
