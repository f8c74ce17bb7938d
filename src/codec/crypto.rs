//! Hybrid payload encryption: a fresh 32-byte AES key wrapped with RSA
//! PKCS#1 v1.5, then AES-256-CTR over the plaintext using the first 16
//! bytes of the AES key as the IV. Output is `wrapped_key || ciphertext`.
//! This is not authenticated encryption — the separate HMAC header covers
//! integrity when a shared key is configured.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::Aes256;
use ctr::Ctr128BE;
use rand::rngs::OsRng;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};

type Aes256Ctr = Ctr128BE<Aes256>;

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("malformed PEM key: {0}")]
    Pem(String),
    #[error("RSA wrap/unwrap failed: {0}")]
    Rsa(String),
    #[error("ciphertext shorter than the RSA key size")]
    Truncated,
}

/// Holds an RSA public key (PKIX DER in PEM) used to encrypt outbound
/// agent payloads.
pub struct Encryptor {
    public_key: RsaPublicKey,
}

impl Encryptor {
    pub fn from_public_key_pem(pem: &str) -> Result<Self, CryptoError> {
        let public_key =
            RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(Self { public_key })
    }

    /// Encrypts `plain`, returning `rsa_wrap(aes_key) || aes_ctr(plain, aes_key)`.
    pub fn encrypt(&self, plain: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut aes_key = [0u8; AES_KEY_LEN];
        rand::RngCore::fill_bytes(&mut OsRng, &mut aes_key);

        let wrapped = self
            .public_key
            .encrypt(&mut OsRng, Pkcs1v15Encrypt, &aes_key)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;

        let mut buf = plain.to_vec();
        let mut cipher = Aes256Ctr::new(&aes_key.into(), aes_key[..AES_IV_LEN].into());
        cipher.apply_keystream(&mut buf);

        let mut out = wrapped;
        out.extend_from_slice(&buf);
        Ok(out)
    }
}

/// Holds an RSA private key (PKCS#1) used by the server to decrypt inbound
/// agent payloads.
pub struct Decryptor {
    private_key: RsaPrivateKey,
}

impl Decryptor {
    pub fn from_private_key_pem(pem: &str) -> Result<Self, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| CryptoError::Pem(e.to_string()))?;
        Ok(Self { private_key })
    }

    pub fn decrypt(&self, input: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let key_size = rsa::traits::PublicKeyParts::size(&self.private_key);
        if input.len() < key_size {
            return Err(CryptoError::Truncated);
        }
        let (wrapped, ciphertext) = input.split_at(key_size);

        let aes_key = self
            .private_key
            .decrypt(Pkcs1v15Encrypt, wrapped)
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        if aes_key.len() != AES_KEY_LEN {
            return Err(CryptoError::Rsa("unwrapped AES key has unexpected length".into()));
        }

        let mut buf = ciphertext.to_vec();
        let mut cipher = Aes256Ctr::new_from_slices(&aes_key, &aes_key[..AES_IV_LEN])
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        cipher.apply_keystream(&mut buf);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;

    fn make_keypair() -> (String, String) {
        let mut rng = OsRng;
        let priv_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        let pub_pem = pub_key.to_public_key_pem(Default::default()).unwrap();
        let priv_pem = priv_key.to_pkcs1_pem(Default::default()).unwrap().to_string();
        (pub_pem, priv_pem)
    }

    #[test]
    fn encrypt_then_decrypt_round_trips() {
        let (pub_pem, priv_pem) = make_keypair();
        let enc = Encryptor::from_public_key_pem(&pub_pem).unwrap();
        let dec = Decryptor::from_private_key_pem(&priv_pem).unwrap();

        let plain = b"[{\"id\":\"k\",\"type\":\"counter\",\"delta\":1}]";
        let wrapped = enc.encrypt(plain).unwrap();
        let got = dec.decrypt(&wrapped).unwrap();
        assert_eq!(got, plain);
    }

    #[test]
    fn malformed_pem_is_a_crypto_error() {
        assert!(Encryptor::from_public_key_pem("not a pem").is_err());
        assert!(Decryptor::from_private_key_pem("not a pem").is_err());
    }
}
