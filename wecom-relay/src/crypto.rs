//! WeCom callback envelope cryptography.
//!
//! Implements the customer-service callback scheme: AES-256-CBC with the key
//! decoded from the 43-char `EncodingAESKey`, IV = first 16 key bytes, and a
//! SHA-1 signature over the sorted `(token, timestamp, nonce, encrypt)`
//! tuple.
//!
//! Encrypted payload layout:
//! `random[16] || msg_len:u32be || msg[msg_len] || corp_id`, PKCS#7-padded
//! to a 32-byte block boundary.

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use rand::Rng;
use sha1::{Digest, Sha1};

type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;

/// WeCom pads to a 32-byte boundary, so pad values run 1..=32 and the stock
/// 16-byte Pkcs7 unpadding cannot be used.
const PAD_BLOCK: usize = 32;

/// The admin console occasionally issues keys whose final base64 character
/// carries non-zero trailing bits; the strict STANDARD engine rejects those.
const LENIENT_B64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Crypto failures for the callback pipeline.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid EncodingAESKey: {0}")]
    InvalidKey(String),

    #[error("Signature mismatch")]
    InvalidSignature,

    #[error("Corp ID mismatch: expected {expected}, got {got}")]
    CorpIdMismatch { expected: String, got: String },

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),
}

/// AES key material derived once at startup from the `EncodingAESKey`.
#[derive(Clone)]
pub struct AesKeyPair {
    key: [u8; 32],
    iv: [u8; 16],
}

impl AesKeyPair {
    /// Decode a 43-character `EncodingAESKey` into key + IV.
    ///
    /// Appending `=` yields canonical base64 which must decode to exactly
    /// 32 bytes; the IV is the first 16 of those.
    pub fn decode(encoding_aes_key: &str) -> Result<Self, CryptoError> {
        if encoding_aes_key.len() != 43 {
            return Err(CryptoError::InvalidKey(format!(
                "expected 43 characters, got {}",
                encoding_aes_key.len()
            )));
        }

        let bytes = LENIENT_B64
            .decode(format!("{encoding_aes_key}="))
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "decoded to {} bytes, expected 32",
                bytes.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&bytes[..16]);
        Ok(Self { key, iv })
    }
}

impl std::fmt::Debug for AesKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs
        f.debug_struct("AesKeyPair").finish_non_exhaustive()
    }
}

/// Compute the callback signature: lowercase SHA-1 hex over the four inputs
/// sorted lexicographically and concatenated.
pub fn compute_signature(token: &str, timestamp: &str, nonce: &str, encrypt: &str) -> String {
    let mut params = [token, timestamp, nonce, encrypt];
    params.sort_unstable();
    let concat = params.join("");

    let mut hasher = Sha1::new();
    hasher.update(concat.as_bytes());
    hex::encode(hasher.finalize())
}

/// Compare two signature strings without short-circuiting on the first
/// differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Verify an external `msg_signature` against the locally computed one.
pub fn verify_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    encrypt: &str,
    msg_signature: &str,
) -> Result<(), CryptoError> {
    let computed = compute_signature(token, timestamp, nonce, encrypt);
    if constant_time_eq(&computed, msg_signature) {
        Ok(())
    } else {
        Err(CryptoError::InvalidSignature)
    }
}

/// Decrypt a base64 ciphertext and return the embedded message text.
///
/// Pad bytes are validated (1..=32, all equal) before the layout is parsed;
/// a tail that fails validation is rejected as malformed rather than
/// trusted via the embedded length prefix.
pub fn decrypt(
    ciphertext_b64: &str,
    keys: &AesKeyPair,
    expected_corp_id: &str,
) -> Result<String, CryptoError> {
    let ciphertext = LENIENT_B64
        .decode(ciphertext_b64)
        .map_err(|e| CryptoError::MalformedCiphertext(format!("base64: {e}")))?;
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "ciphertext length {} is not a positive multiple of 16",
            ciphertext.len()
        )));
    }

    let decryptor = Aes256CbcDec::new(&keys.key.into(), &keys.iv.into());
    let mut buffer = ciphertext;
    let decrypted = decryptor
        .decrypt_padded_mut::<NoPadding>(&mut buffer)
        .map_err(|e| CryptoError::MalformedCiphertext(format!("AES: {e}")))?;

    let plaintext = strip_pkcs7(decrypted)?;
    if plaintext.len() < 20 {
        return Err(CryptoError::MalformedCiphertext(format!(
            "plaintext too short: {} bytes",
            plaintext.len()
        )));
    }

    // Layout: random[16] | msg_len:u32be | msg | corp_id
    let msg_len =
        u32::from_be_bytes([plaintext[16], plaintext[17], plaintext[18], plaintext[19]]) as usize;
    let msg_end = 20usize
        .checked_add(msg_len)
        .filter(|end| *end <= plaintext.len())
        .ok_or_else(|| {
            CryptoError::MalformedCiphertext(format!(
                "msg_len {msg_len} exceeds plaintext length {}",
                plaintext.len()
            ))
        })?;

    let corp_id = String::from_utf8_lossy(&plaintext[msg_end..]);
    if corp_id != expected_corp_id {
        return Err(CryptoError::CorpIdMismatch {
            expected: expected_corp_id.to_string(),
            got: corp_id.into_owned(),
        });
    }

    String::from_utf8(plaintext[20..msg_end].to_vec())
        .map_err(|e| CryptoError::MalformedCiphertext(format!("UTF-8: {e}")))
}

/// Encrypt a message into the WeCom envelope layout and base64-encode it.
///
/// Only used for the GET-verify echo response.
pub fn encrypt(plaintext: &str, corp_id: &str, keys: &AesKeyPair) -> Result<String, CryptoError> {
    let mut rng = rand::thread_rng();
    let random: [u8; 16] = rng.gen();

    let msg = plaintext.as_bytes();
    let mut buffer = Vec::with_capacity(16 + 4 + msg.len() + corp_id.len() + PAD_BLOCK);
    buffer.extend_from_slice(&random);
    buffer.extend_from_slice(&(msg.len() as u32).to_be_bytes());
    buffer.extend_from_slice(msg);
    buffer.extend_from_slice(corp_id.as_bytes());

    let pad = PAD_BLOCK - (buffer.len() % PAD_BLOCK);
    buffer.extend(std::iter::repeat(pad as u8).take(pad));

    let total = buffer.len();
    let encryptor = Aes256CbcEnc::new(&keys.key.into(), &keys.iv.into());
    let ciphertext = encryptor
        .encrypt_padded_mut::<NoPadding>(&mut buffer, total)
        .map_err(|e| CryptoError::MalformedCiphertext(format!("AES: {e}")))?;

    Ok(base64::engine::general_purpose::STANDARD.encode(ciphertext))
}

/// Validate and strip PKCS#7 padding over a 32-byte block size.
fn strip_pkcs7(decrypted: &[u8]) -> Result<&[u8], CryptoError> {
    let pad = *decrypted
        .last()
        .ok_or_else(|| CryptoError::MalformedCiphertext("empty plaintext".into()))?
        as usize;
    if pad == 0 || pad > PAD_BLOCK || pad > decrypted.len() {
        return Err(CryptoError::MalformedCiphertext(format!(
            "invalid pad value {pad}"
        )));
    }
    let body_len = decrypted.len() - pad;
    if decrypted[body_len..].iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::MalformedCiphertext(
            "inconsistent pad bytes".into(),
        ));
    }
    Ok(&decrypted[..body_len])
}
