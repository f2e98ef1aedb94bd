use std::io::Read;
use std::path::Path;

use sha2::digest::Digest;
use sha2::Sha256;

const AUTH_SECRET_LABEL: &[u8] = b"fleet-auth-v1";

/// SHA-256 of a byte slice, hex-encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Streaming SHA-256 of a file's contents, hex-encoded.
pub fn file_sha256_hex(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Labeled hash of an auth secret or password, as stored in agent and
/// user records. The label separates this domain from file checksums.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(AUTH_SECRET_LABEL);
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Generate a random auth secret for a newly registered agent.
pub fn random_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn file_digest_matches_slice_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::write(&path, b"some file contents").unwrap();
        assert_eq!(
            file_sha256_hex(&path).unwrap(),
            sha256_hex(b"some file contents")
        );
    }

    #[test]
    fn secret_hash_is_labeled() {
        // The label must separate secret hashes from plain digests.
        assert_ne!(hash_secret("hunter2"), sha256_hex(b"hunter2"));
        assert_eq!(hash_secret("hunter2"), hash_secret("hunter2"));
    }

    #[test]
    fn random_secrets_differ() {
        assert_ne!(random_secret(), random_secret());
    }
}
