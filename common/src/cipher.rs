//! Optional AES-CBC framing with a trailing shared secret.
//!
//! Sealed payload: `datagram || secret || 0x00`, PKCS#7 padded to the block
//! size and encrypted with the provisioned key and fixed IV.

use std::sync::Mutex;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use tracing::info;

use crate::{
    config::EncryptionConfig,
    error::ProtocolError,
    protocol::{Datagram, DATAGRAM_LEN},
};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

#[derive(Clone)]
enum Key {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

#[derive(Clone)]
pub struct DatagramCipher {
    key: Key,
    iv: [u8; IV_LEN],
    secret: Vec<u8>,
}

impl std::fmt::Debug for DatagramCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self.key {
            Key::Aes128(_) => 128,
            Key::Aes256(_) => 256,
        };
        f.debug_struct("DatagramCipher")
            .field("bits", &bits)
            .finish_non_exhaustive()
    }
}

impl DatagramCipher {
    pub fn new(key: &[u8], iv: &[u8], secret: &str) -> Result<Self, ProtocolError> {
        let key = match key.len() {
            16 => Key::Aes128(copy_array(key)),
            32 => Key::Aes256(copy_array(key)),
            other => {
                return Err(ProtocolError::KeyMaterial(format!(
                    "key must be 16 or 32 bytes, got {other}"
                )))
            }
        };
        if iv.len() != IV_LEN {
            return Err(ProtocolError::KeyMaterial(format!(
                "iv must be {IV_LEN} bytes, got {}",
                iv.len()
            )));
        }
        if secret.as_bytes().contains(&0) {
            return Err(ProtocolError::KeyMaterial(
                "secret must not contain NUL".to_string(),
            ));
        }
        Ok(Self {
            key,
            iv: copy_array(iv),
            secret: secret.as_bytes().to_vec(),
        })
    }

    pub fn from_config(config: &EncryptionConfig) -> Result<Self, ProtocolError> {
        let key = STANDARD
            .decode(config.key_b64.trim())
            .map_err(|err| ProtocolError::KeyMaterial(format!("key: {err}")))?;
        let iv = STANDARD
            .decode(config.iv_b64.trim())
            .map_err(|err| ProtocolError::KeyMaterial(format!("iv: {err}")))?;
        Self::new(&key, &iv, &config.secret)
    }

    pub fn seal(&self, datagram: &Datagram) -> Vec<u8> {
        let mut plain = Vec::with_capacity(DATAGRAM_LEN + self.secret.len() + 1);
        plain.extend_from_slice(&datagram.encode());
        plain.extend_from_slice(&self.secret);
        plain.push(0);

        match &self.key {
            Key::Aes128(key) => Aes128CbcEnc::new(&(*key).into(), &self.iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(&plain),
            Key::Aes256(key) => Aes256CbcEnc::new(&(*key).into(), &self.iv.into())
                .encrypt_padded_vec_mut::<Pkcs7>(&plain),
        }
    }

    pub fn open(&self, sealed: &[u8]) -> Result<Datagram, ProtocolError> {
        let plain = match &self.key {
            Key::Aes128(key) => Aes128CbcDec::new(&(*key).into(), &self.iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(sealed),
            Key::Aes256(key) => Aes256CbcDec::new(&(*key).into(), &self.iv.into())
                .decrypt_padded_vec_mut::<Pkcs7>(sealed),
        }
        .map_err(|_| ProtocolError::Decrypt)?;

        let trailer = plain.get(DATAGRAM_LEN..).ok_or(ProtocolError::Length {
            expected: DATAGRAM_LEN + self.secret.len() + 1,
            actual: plain.len(),
        })?;
        let (secret, terminator) = trailer.split_at(trailer.len().saturating_sub(1));
        if secret != self.secret.as_slice() || terminator != &[0u8][..] {
            return Err(ProtocolError::SecretMismatch);
        }

        Datagram::decode(&plain[..DATAGRAM_LEN])
    }
}

fn copy_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

/// Process-wide framing layer. Re-keying and every seal/open share one lock.
#[derive(Debug, Default)]
pub struct Framing {
    cipher: Mutex<Option<DatagramCipher>>,
}

impl Framing {
    pub fn plaintext() -> Self {
        Self::default()
    }

    pub fn encrypted(cipher: DatagramCipher) -> Self {
        Self {
            cipher: Mutex::new(Some(cipher)),
        }
    }

    pub fn from_config(config: Option<&EncryptionConfig>) -> Result<Self, ProtocolError> {
        match config {
            Some(config) => {
                info!("udp encryption enabled");
                Ok(Self::encrypted(DatagramCipher::from_config(config)?))
            }
            None => Ok(Self::plaintext()),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher
            .lock()
            .map(|cipher| cipher.is_some())
            .unwrap_or(false)
    }

    pub fn rekey(&self, cipher: Option<DatagramCipher>) {
        let mut active = self.cipher.lock().unwrap_or_else(|err| err.into_inner());
        info!(
            "udp framing re-keyed, encryption {}",
            if cipher.is_some() { "on" } else { "off" }
        );
        *active = cipher;
    }

    pub fn seal(&self, datagram: &Datagram) -> Vec<u8> {
        let active = self.cipher.lock().unwrap_or_else(|err| err.into_inner());
        match active.as_ref() {
            Some(cipher) => cipher.seal(datagram),
            None => datagram.encode().to_vec(),
        }
    }

    pub fn open(&self, raw: &[u8]) -> Result<Datagram, ProtocolError> {
        let active = self.cipher.lock().unwrap_or_else(|err| err.into_inner());
        match active.as_ref() {
            Some(cipher) => cipher.open(raw),
            None => Datagram::decode(raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Request;

    const KEY256: &[u8; 32] = b"12345678901234567890123456789012";
    const KEY128: &[u8; 16] = b"0123456789abcdef";
    const IV: &[u8; 16] = b"1234567890123456";

    #[test]
    fn sealed_report_round_trips() {
        let cipher = DatagramCipher::new(KEY128, IV, "topsecret").unwrap();
        let report = Datagram::report("bedroom", 21.8, 22.5);

        let sealed = cipher.seal(&report);
        assert_eq!(sealed.len() % 16, 0);

        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(opened.request, Request::Report);
        assert_eq!(opened.name, "bedroom");
        assert_eq!(opened.value, 21.8);
        assert_eq!(opened.setpoint, 22.5);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let sender = DatagramCipher::new(KEY256, IV, "topsecret").unwrap();
        let receiver = DatagramCipher::new(KEY256, IV, "wrongsecret").unwrap();

        let sealed = sender.seal(&Datagram::report("bedroom", 21.8, 22.5));
        assert!(receiver.open(&sealed).is_err());
    }

    #[test]
    fn wrong_key_is_rejected() {
        let sender = DatagramCipher::new(KEY128, IV, "topsecret").unwrap();
        let receiver = DatagramCipher::new(b"fedcba9876543210", IV, "topsecret").unwrap();

        let sealed = sender.seal(&Datagram::query_all());
        assert!(receiver.open(&sealed).is_err());
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let cipher = DatagramCipher::new(KEY128, IV, "topsecret").unwrap();
        let sealed = cipher.seal(&Datagram::query_all());
        assert!(matches!(
            cipher.open(&sealed[..sealed.len() - 3]),
            Err(ProtocolError::Decrypt)
        ));
    }

    #[test]
    fn rejects_bad_key_material() {
        assert!(DatagramCipher::new(&KEY128[..10], IV, "s").is_err());
        assert!(DatagramCipher::new(KEY128, &IV[..8], "s").is_err());

        let config = EncryptionConfig {
            key_b64: "not base64!".to_string(),
            iv_b64: "MTIzNDU2Nzg5MDEyMzQ1Ng==".to_string(),
            secret: "s".to_string(),
        };
        assert!(DatagramCipher::from_config(&config).is_err());
    }

    #[test]
    fn base64_material_selects_key_size() {
        let config = EncryptionConfig {
            key_b64: STANDARD.encode(KEY256),
            iv_b64: STANDARD.encode(IV),
            secret: "topsecret".to_string(),
        };
        let cipher = DatagramCipher::from_config(&config).unwrap();
        assert!(matches!(cipher.key, Key::Aes256(_)));
    }

    #[test]
    fn framing_rekey_switches_layers() {
        let framing = Framing::plaintext();
        let plain = framing.seal(&Datagram::query_all());
        assert_eq!(plain.len(), DATAGRAM_LEN);

        framing.rekey(Some(DatagramCipher::new(KEY128, IV, "topsecret").unwrap()));
        assert!(framing.is_encrypted());
        assert!(framing.open(&plain).is_err());

        let sealed = framing.seal(&Datagram::query_all());
        assert_eq!(framing.open(&sealed).unwrap().request, Request::QueryAll);
    }
}
