mod checksum;
mod signature;

pub use checksum::{sha256_file, sha256_hex, verify_sha256, verify_sha256_file, Sha256Writer};
pub use signature::{verify_ed25519_signature_hex, Ed25519Verifier, SignatureVerifier};
