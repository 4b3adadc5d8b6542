use anyhow::{Context, Result};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

/// Callback the update finder uses to authenticate downloaded metadata.
///
/// Signing itself happens outside this workspace; implementations only decide
/// whether a payload and its detached signature belong together.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool>;
}

/// Verifies hex-encoded detached Ed25519 signatures against one public key.
#[derive(Debug, Clone)]
pub struct Ed25519Verifier {
    public_key_hex: String,
}

impl Ed25519Verifier {
    pub fn new(public_key_hex: impl Into<String>) -> Result<Self> {
        let public_key_hex = public_key_hex.into();
        decode_public_key(&public_key_hex)?;
        Ok(Self { public_key_hex })
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<bool> {
        let signature_hex =
            std::str::from_utf8(signature).context("Ed25519 signature file is not UTF-8")?;
        verify_ed25519_signature_hex(payload, &self.public_key_hex, signature_hex.trim())
    }
}

fn decode_public_key(public_key_hex: &str) -> Result<VerifyingKey> {
    let public_key_bytes =
        hex::decode(public_key_hex).context("failed to decode Ed25519 public key hex")?;
    let public_key_len = public_key_bytes.len();
    let public_key_array: [u8; 32] = public_key_bytes.try_into().map_err(|_| {
        anyhow::anyhow!(
            "invalid Ed25519 public key length: expected 32 bytes, got {}",
            public_key_len
        )
    })?;
    VerifyingKey::from_bytes(&public_key_array).context("invalid Ed25519 public key bytes")
}

pub fn verify_ed25519_signature_hex(
    payload: &[u8],
    public_key_hex: &str,
    signature_hex: &str,
) -> Result<bool> {
    let verifying_key = decode_public_key(public_key_hex)?;
    let signature_bytes =
        hex::decode(signature_hex).context("failed to decode Ed25519 signature hex")?;
    let signature_len = signature_bytes.len();
    let signature_array: [u8; 64] = signature_bytes.try_into().map_err(|_| {
        anyhow::anyhow!(
            "invalid Ed25519 signature length: expected 64 bytes, got {}",
            signature_len
        )
    })?;
    let signature = Signature::from_bytes(&signature_array);

    Ok(verifying_key.verify(payload, &signature).is_ok())
}
