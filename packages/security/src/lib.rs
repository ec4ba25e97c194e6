// ABOUTME: Key derivation, encryption, and secret-file handling for Courier
// ABOUTME: Provides the cryptographic building blocks of the encrypted token store

pub mod compare;
pub mod encryption;
pub mod files;

// Re-export main types for convenience
pub use compare::constant_time_eq;
pub use encryption::kdf::{derive_key, derive_key_with_salt, salt_path_for, SALT_FILE_NAME};
pub use encryption::{DerivedKey, EncryptionError, TokenCipher};
