//! Node identity and sealed transfer bodies
//!
//! Every node owns a static X25519 keypair; the public half is announced as
//! hex in swarm requests and file requests. Payloads are sealed to the
//! recipient's public key with an ephemeral key exchange:
//!
//! ```text
//! 1. ss  = x25519(ephemeral_sk, recipient_pk)
//! 2. key = HKDF-SHA256(ss, info = "lynx-transfer-v1" || ephemeral_pk || recipient_pk)
//! 3. ct  = ChaCha20-Poly1305(key, nonce, plaintext)
//! ```
//!
//! Wire format: `[ephemeral_pk (32)] [nonce (12)] [ciphertext + tag (16)]`.

use crate::error::{LynxError, Result};
use crate::protocol_core::write_atomic;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use std::path::Path;
use x25519_dalek::{PublicKey, StaticSecret};

/// Nonce size for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// X25519 public key size
pub const KEY_SIZE: usize = 32;

/// Smallest valid sealed body: key + nonce + tag
pub const SEAL_OVERHEAD: usize = KEY_SIZE + NONCE_SIZE + 16;

/// Domain separation string for HKDF
const HKDF_INFO: &[u8] = b"lynx-transfer-v1";

/// The node's long-lived X25519 keypair
#[derive(Clone)]
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_hex())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Result<Self> {
        Ok(Self::from_secret_bytes(random_bytes::<32>()?))
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Load the hex secret at `path`, creating and persisting a new one if missing
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let bytes = decode_key(text.trim())
                    .map_err(|e| LynxError::Crypto(format!("{}: {e}", path.display())))?;
                Ok(Self::from_secret_bytes(bytes))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let kp = Self::generate()?;
                write_atomic(path, hex::encode(kp.secret.to_bytes()).as_bytes())?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
                }
                tracing::info!(path = %path.display(), "generated node identity");
                Ok(kp)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Announced form of the public key
    pub fn public_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Open a body sealed to this keypair's public key
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(LynxError::Crypto(format!(
                "sealed body too short ({} bytes)",
                sealed.len()
            )));
        }
        let mut eph = [0u8; KEY_SIZE];
        eph.copy_from_slice(&sealed[..KEY_SIZE]);
        let ephemeral_public = PublicKey::from(eph);
        let nonce = Nonce::from_slice(&sealed[KEY_SIZE..KEY_SIZE + NONCE_SIZE]);

        let shared = self.secret.diffie_hellman(&ephemeral_public);
        let key = derive_key(shared.as_bytes(), &eph, self.public.as_bytes())?;
        ChaCha20Poly1305::new((&key).into())
            .decrypt(nonce, &sealed[KEY_SIZE + NONCE_SIZE..])
            .map_err(|e| LynxError::Crypto(format!("decryption failed: {e}")))
    }
}

/// Seal `plaintext` to the hex-encoded recipient public key
pub fn seal(recipient_hex: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
    let recipient = PublicKey::from(decode_key(recipient_hex)?);
    let ephemeral_secret = StaticSecret::from(random_bytes::<32>()?);
    let ephemeral_public = PublicKey::from(&ephemeral_secret);
    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let key = derive_key(shared.as_bytes(), ephemeral_public.as_bytes(), recipient.as_bytes())?;

    let nonce_bytes = random_bytes::<NONCE_SIZE>()?;
    let ciphertext = ChaCha20Poly1305::new((&key).into())
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|e| LynxError::Crypto(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(KEY_SIZE + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(ephemeral_public.as_bytes());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// True if `s` is a well-formed announced key
pub fn is_valid_public_key(s: &str) -> bool {
    decode_key(s).is_ok()
}

fn decode_key(s: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = hex::decode(s).map_err(|e| LynxError::Crypto(format!("bad key encoding: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| LynxError::Crypto(format!("key must be {KEY_SIZE} bytes")))
}

/// Derive a 32-byte key from a shared secret using HKDF-SHA256.
fn derive_key(shared: &[u8], ephemeral_pk: &[u8], recipient_pk: &[u8]) -> Result<[u8; 32]> {
    if shared.iter().all(|b| *b == 0) {
        // low-order point from a hostile peer
        return Err(LynxError::Crypto("degenerate shared secret".into()));
    }
    let mut info = Vec::with_capacity(HKDF_INFO.len() + 2 * KEY_SIZE);
    info.extend_from_slice(HKDF_INFO);
    info.extend_from_slice(ephemeral_pk);
    info.extend_from_slice(recipient_pk);

    let mut output = [0u8; 32];
    Hkdf::<Sha256>::new(None, shared)
        .expand(&info, &mut output)
        .map_err(|e| LynxError::Crypto(format!("hkdf: {e}")))?;
    Ok(output)
}

fn random_bytes<const N: usize>() -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    getrandom::getrandom(&mut buf)
        .map_err(|e| LynxError::Crypto(format!("random source: {e}")))?;
    Ok(buf)
}
