use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use k256::ecdsa::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;

const KEY_FILE: &str = "server.key";
const PUB_FILE: &str = "server.pub";

/// The server's ECDSA keypair. All tokens and queue snapshots issued by
/// this server are signed with it; agents pin the public half.
pub struct ServerKeys {
    signing: SigningKey,
    verifying: VerifyingKey,
}

impl ServerKeys {
    /// Load the keypair from the state directory, generating and persisting
    /// a fresh one on first start. The private key file is created with
    /// owner-only permissions.
    pub fn load_or_create(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("creating state dir {}", state_dir.display()))?;
        let key_path = state_dir.join(KEY_FILE);

        let signing = if key_path.exists() {
            let hex_key = fs::read_to_string(&key_path)
                .with_context(|| format!("reading {}", key_path.display()))?;
            let bytes = hex::decode(hex_key.trim()).context("server key is not valid hex")?;
            SigningKey::from_slice(&bytes).context("server key bytes are not a valid key")?
        } else {
            let signing = SigningKey::random(&mut OsRng);
            fs::write(&key_path, hex::encode(signing.to_bytes()))
                .with_context(|| format!("writing {}", key_path.display()))?;
            restrict_permissions(&key_path)?;
            signing
        };

        let verifying = *signing.verifying_key();
        let pub_path = state_dir.join(PUB_FILE);
        fs::write(&pub_path, Self::public_key_b64_of(&verifying))
            .with_context(|| format!("writing {}", pub_path.display()))?;

        Ok(Self { signing, verifying })
    }

    pub fn signing(&self) -> &SigningKey {
        &self.signing
    }

    pub fn verifying(&self) -> &VerifyingKey {
        &self.verifying
    }

    /// SEC1 public key, base64-encoded, as published in `server.pub` for
    /// agents to pin.
    pub fn public_key_b64(&self) -> String {
        Self::public_key_b64_of(&self.verifying)
    }

    fn public_key_b64_of(key: &VerifyingKey) -> String {
        let public: k256::PublicKey = key.into();
        BASE64.encode(public.to_sec1_bytes())
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("setting permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
