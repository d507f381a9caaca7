use std::time::{Duration, SystemTime};

use base64::{engine::general_purpose::URL_SAFE, Engine};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use url::Url;

type HmacSha1 = Hmac<Sha1>;

pub const AUTHORIZATION_PREFIX_QBOX: &str = "QBox ";

#[derive(Clone)]
pub struct Credentials {
    pub access_key: String,
    secret_key: Vec<u8>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl Credentials {
    pub fn new(access_key: &str, secret_key: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.as_bytes().to_vec(),
        }
    }

    pub fn secret_key(&self) -> &[u8] {
        &self.secret_key
    }

    /// `<ak>:<urlsafe-base64(hmac-sha1(sk, data))>`
    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac = match HmacSha1::new_from_slice(&self.secret_key) {
            Ok(mac) => mac,
            // HMAC accepts keys of any length
            Err(_) => unreachable!(),
        };
        mac.update(data);
        let sign = URL_SAFE.encode(mac.finalize().into_bytes());
        format!("{}:{}", self.access_key, sign)
    }

    /// QBox token over the request path, query and, for form bodies, body.
    pub fn sign_request(&self, url: &Url, form_body: Option<&[u8]>) -> String {
        let mut data = url.path().as_bytes().to_vec();
        if let Some(query) = url.query() {
            data.push(b'?');
            data.extend_from_slice(query.as_bytes());
        }
        data.push(b'\n');
        if let Some(body) = form_body {
            data.extend_from_slice(body);
        }
        self.sign(&data)
    }

    pub fn authorization(&self, url: &Url) -> String {
        format!("{}{}", AUTHORIZATION_PREFIX_QBOX, self.sign_request(url, None))
    }

    /// Appends `e=<deadline>&token=<sign>` for private bucket downloads.
    pub fn sign_download_url(&self, url: &str, ttl: Duration) -> String {
        let deadline = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + ttl.as_secs();
        let sep = if url.contains('?') { '&' } else { '?' };
        let url = format!("{}{}e={}", url, sep, deadline);
        let token = self.sign(url.as_bytes());
        format!("{}&token={}", url, token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign() {
        // HMAC-SHA1("key", "The quick brown fox jumps over the lazy dog")
        // = de7c9b85b8b78aa6bc8a7a36f70a90701c9db4d9
        let creds = Credentials::new("ak", "key");
        let token = creds.sign(b"The quick brown fox jumps over the lazy dog");
        assert_eq!(token, "ak:3nybhbi3iqa8ino29wqQcBydtNk=");
    }

    #[test]
    fn test_sign_request_includes_query() {
        let creds = Credentials::new("ak", "sk");
        let with_query = Url::parse("https://rsf.example.com/list?bucket=b&prefix=a").unwrap();
        let without_query = Url::parse("https://rsf.example.com/list").unwrap();

        let signed = creds.sign_request(&with_query, None);
        assert_eq!(signed, creds.sign(b"/list?bucket=b&prefix=a\n"));
        assert_ne!(signed, creds.sign_request(&without_query, None));
        assert!(creds.authorization(&with_query).starts_with("QBox ak:"));
    }

    #[test]
    fn test_sign_download_url() {
        let creds = Credentials::new("ak", "sk");
        let cases = vec![
            ("http://cdn.example.com/a.txt", "http://cdn.example.com/a.txt?e="),
            ("http://cdn.example.com/a.txt?x=1", "http://cdn.example.com/a.txt?x=1&e="),
        ];

        for (input, expected_prefix) in cases {
            let signed = creds.sign_download_url(input, Duration::from_secs(3600));
            assert!(signed.starts_with(expected_prefix), "failed for case: {}", input);
            assert!(signed.contains("&token=ak:"), "failed for case: {}", input);
        }
    }

    #[test]
    fn test_debug_hides_secret() {
        let creds = Credentials::new("ak", "super-secret");
        assert!(!format!("{:?}", creds).contains("super-secret"));
    }
}
