//! Obfuscated query-string tokens carried in mount URLs.
//!
//! A token is `urlsafe-base64(tag || masked)`, where `masked` is the
//! form-urlencoded parameters XORed with a SHA-256 keystream and `tag` is the
//! first bytes of an HMAC-SHA256 over the plain parameters.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::model::fs::FSError;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &[u8] = b"kodofs.protected.v1";
const TAG_LEN: usize = 8;

fn derive_key(key: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(KEY_SALT);
    hasher.update(key.as_bytes());
    hasher.finalize().into()
}

fn apply_keystream(key: &[u8; 32], data: &mut [u8]) {
    for (block, chunk) in data.chunks_mut(32).enumerate() {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update((block as u64).to_be_bytes());
        let stream = hasher.finalize();
        for (b, s) in chunk.iter_mut().zip(stream.iter()) {
            *b ^= s;
        }
    }
}

fn mac(key: &[u8; 32], data: &[u8]) -> HmacSha256 {
    let mut mac = match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => unreachable!(),
    };
    mac.update(data);
    mac
}

pub fn encode(params: &[(&str, &str)], key: &str) -> String {
    let key = derive_key(key);
    let plain = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
        .into_bytes();

    let tag = mac(&key, &plain).finalize().into_bytes();
    let mut masked = plain;
    apply_keystream(&key, &mut masked);

    let mut out = tag[..TAG_LEN].to_vec();
    out.extend_from_slice(&masked);
    URL_SAFE_NO_PAD.encode(out)
}

pub fn decode(token: &str, key: &str) -> Result<Vec<(String, String)>, FSError> {
    let key = derive_key(key);
    let raw = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|_| FSError::Permission("malformed token".to_string()))?;
    if raw.len() < TAG_LEN {
        return Err(FSError::Permission("malformed token".to_string()));
    }

    let (tag, masked) = raw.split_at(TAG_LEN);
    let mut plain = masked.to_vec();
    apply_keystream(&key, &mut plain);

    mac(&key, &plain)
        .verify_truncated_left(tag)
        .map_err(|_| FSError::Permission("token verification failed".to_string()))?;

    Ok(url::form_urlencoded::parse(&plain)
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let token = encode(&[("ak", "access"), ("sk", "se/cret+=")], "k1");
        let params = decode(&token, "k1").unwrap();
        assert_eq!(
            params,
            vec![
                ("ak".to_string(), "access".to_string()),
                ("sk".to_string(), "se/cret+=".to_string()),
            ]
        );
        assert!(!token.contains("access"));
    }

    #[test]
    fn test_decode_rejects() {
        let token = encode(&[("ak", "a"), ("sk", "b")], "k1");
        let mut tampered = token.clone().into_bytes();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        let cases = vec![
            (token.as_str(), "other-key"),
            (tampered.as_str(), "k1"),
            ("!!!", "k1"),
            ("", "k1"),
        ];

        for (input, key) in cases {
            assert!(
                matches!(decode(input, key), Err(FSError::Permission(_))),
                "failed for case: {}",
                input
            );
        }
    }
}
