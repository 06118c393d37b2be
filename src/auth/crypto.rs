//! Token generation and secret hashing.

use argon2::{
    password_hash::{PasswordHashString, PasswordHasher, SaltString},
    Argon2, PasswordVerifier,
};
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};

/// Hashes a secret using Argon2 with a random salt.
pub fn hash_secret(secret: &str) -> eyre::Result<PasswordHashString> {
    let argon2 = Argon2::default();

    let salt = SaltString::generate(&mut rand::thread_rng());

    Ok(argon2
        .hash_password(secret.as_bytes(), salt.as_salt())
        .map_err(|e| eyre::eyre!("Error hashing secret: {e}"))?
        .serialize())
}

/// Verifies a secret against its Argon2 hash.
pub fn verify_secret(secret: SecretString, hash: PasswordHashString) -> eyre::Result<()> {
    Argon2::default()
        .verify_password(secret.expose_secret().as_bytes(), &hash.password_hash())
        .map_err(|e| eyre::eyre!("Error verifying secret: {e}"))
}

/// Generates a random token of size N bytes, encoded in base58.
pub fn generate_token<const N: usize>(mut rng: impl Rng) -> eyre::Result<String> {
    let mut token = [0u8; N];
    rng.try_fill_bytes(&mut token)?;
    Ok(bs58::encode(token).into_string())
}

/// A freshly generated API key and the hash to configure the server with.
pub struct GeneratedKey {
    pub key: String,
    pub hash: PasswordHashString,
}

pub fn generate_api_key() -> eyre::Result<GeneratedKey> {
    let key = generate_token::<24>(rand::thread_rng())?;
    let hash = hash_secret(&key)?;

    Ok(GeneratedKey { key, hash })
}
