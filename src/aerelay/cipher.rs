//! Optional sealing of pipe chunks.
//!
//! Both ends of a pipe contribute a 32-byte secret during the channel
//! handshake. Keys are derived with HKDF-SHA256 over the two secrets, one key
//! per direction. Each sealed chunk is `u64 counter || ciphertext || tag`;
//! counters start at 0 and must strictly increase.

use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::generic_array::GenericArray;
use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::aerelay::protocol::Secret;

const INFO_CLIENT_TO_HOST: &[u8] = b"aerelay pipe client->host";
const INFO_HOST_TO_CLIENT: &[u8] = b"aerelay pipe host->client";
const COUNTER_LEN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("sealed chunk too short")]
    Truncated,
    #[error("counter {got} not after {last}")]
    Replay { got: u64, last: u64 },
    #[error("counter exhausted")]
    Exhausted,
    #[error("authentication failed")]
    BadTag,
}

/// Transforms chunks on their way through a pipe. `seal` runs on data leaving
/// the local socket, `open` on data arriving for it.
pub trait PipeCipher: Send {
    fn seal(&mut self, plain: &[u8]) -> Result<Bytes, CipherError>;
    fn open(&mut self, sealed: &[u8]) -> Result<Bytes, CipherError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Host,
}

pub struct ChaChaPipe {
    seal_key: ChaCha20Poly1305,
    open_key: ChaCha20Poly1305,
    next_seal: u64,
    last_open: Option<u64>,
}

impl std::fmt::Debug for ChaChaPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaChaPipe")
            .field("next_seal", &self.next_seal)
            .field("last_open", &self.last_open)
            .finish_non_exhaustive()
    }
}

impl ChaChaPipe {
    pub fn derive(client: &Secret, host: &Secret, side: Side) -> Result<Self, CipherError> {
        let mut ikm = [0u8; 64];
        ikm[..32].copy_from_slice(client);
        ikm[32..].copy_from_slice(host);
        let hk = Hkdf::<Sha256>::new(None, &ikm);

        let mut c2h = [0u8; 32];
        let mut h2c = [0u8; 32];
        hk.expand(INFO_CLIENT_TO_HOST, &mut c2h)
            .map_err(|_| CipherError::KeyDerivation)?;
        hk.expand(INFO_HOST_TO_CLIENT, &mut h2c)
            .map_err(|_| CipherError::KeyDerivation)?;

        let (seal, open) = match side {
            Side::Client => (c2h, h2c),
            Side::Host => (h2c, c2h),
        };
        Ok(Self {
            seal_key: ChaCha20Poly1305::new(GenericArray::from_slice(&seal)),
            open_key: ChaCha20Poly1305::new(GenericArray::from_slice(&open)),
            next_seal: 0,
            last_open: None,
        })
    }
}

fn nonce_for(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[4..].copy_from_slice(&counter.to_be_bytes());
    n
}

impl PipeCipher for ChaChaPipe {
    fn seal(&mut self, plain: &[u8]) -> Result<Bytes, CipherError> {
        let counter = self.next_seal;
        self.next_seal = counter.checked_add(1).ok_or(CipherError::Exhausted)?;

        let nonce = nonce_for(counter);
        let ct = self
            .seal_key
            .encrypt(GenericArray::from_slice(&nonce), plain)
            .map_err(|_| CipherError::BadTag)?;
        let mut out = BytesMut::with_capacity(COUNTER_LEN + ct.len());
        out.put_u64(counter);
        out.put_slice(&ct);
        Ok(out.freeze())
    }

    fn open(&mut self, sealed: &[u8]) -> Result<Bytes, CipherError> {
        if sealed.len() < COUNTER_LEN {
            return Err(CipherError::Truncated);
        }
        let mut cb = [0u8; COUNTER_LEN];
        cb.copy_from_slice(&sealed[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(cb);
        if let Some(last) = self.last_open {
            if counter <= last {
                return Err(CipherError::Replay { got: counter, last });
            }
        }

        let nonce = nonce_for(counter);
        let plain = self
            .open_key
            .decrypt(GenericArray::from_slice(&nonce), &sealed[COUNTER_LEN..])
            .map_err(|_| CipherError::BadTag)?;
        self.last_open = Some(counter);
        Ok(Bytes::from(plain))
    }
}
