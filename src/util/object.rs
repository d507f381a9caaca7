use crate::{model::fs::FSError, util::protected};

pub const SCHEME: &str = "kodo";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Kodo,
    S3,
}

impl Backend {
    pub fn is_kodo(&self) -> bool {
        matches!(self, Backend::Kodo)
    }
}

pub fn parse_backend(name: &str) -> Result<Backend, FSError> {
    match name {
        "kodo" => Ok(Backend::Kodo),
        "s3" => Ok(Backend::S3),
        _ => Err(FSError::Permission(format!("unknown backend: {}", name))),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MountUrl {
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
}

/// Parses `kodo:<bucket>?<token>`, where the token is a protected encoding of
/// the `ak` and `sk` parameters.
pub fn parse_mount_url(url: &str, key: &str) -> Result<MountUrl, FSError> {
    let url = url
        .strip_prefix(SCHEME)
        .and_then(|rest| rest.strip_prefix(':'))
        .unwrap_or(url);

    let (bucket, token) = match url.split_once('?') {
        None => return Err(FSError::Permission("missing token in mount url".to_string())),
        Some(parts) => parts,
    };

    let params = protected::decode(token, key)?;
    let get = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    let (access_key, secret_key) = (get("ak"), get("sk"));
    if access_key.is_empty() || secret_key.is_empty() {
        return Err(FSError::Permission("token lacks ak or sk".to_string()));
    }

    Ok(MountUrl {
        bucket: bucket.to_string(),
        access_key,
        secret_key,
    })
}

pub fn format_mount_url(bucket: &str, access_key: &str, secret_key: &str, key: &str) -> String {
    let token = protected::encode(&[("ak", access_key), ("sk", secret_key)], key);
    format!("{}:{}?{}", SCHEME, bucket, token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_backend() {
        assert!(matches!(parse_backend("kodo"), Ok(Backend::Kodo)));
        assert!(matches!(parse_backend("s3"), Ok(Backend::S3)));
        assert!(matches!(parse_backend("gcs"), Err(_)));
    }

    #[test]
    fn test_parse_mount_url() {
        let url = format_mount_url("bucket", "ak1", "sk1", "k");
        assert!(url.starts_with("kodo:bucket?"));

        let parsed = parse_mount_url(&url, "k").unwrap();
        assert_eq!(
            parsed,
            MountUrl {
                bucket: "bucket".to_string(),
                access_key: "ak1".to_string(),
                secret_key: "sk1".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_mount_url_rejects() {
        let no_sk = format!(
            "kodo:bucket?{}",
            protected::encode(&[("ak", "ak1")], "k")
        );
        let empty_ak = format!(
            "kodo:bucket?{}",
            protected::encode(&[("ak", ""), ("sk", "sk1")], "k")
        );

        let cases = vec![
            "kodo:bucket".to_string(),
            "kodo:bucket?garbage".to_string(),
            no_sk,
            empty_ak,
        ];

        for input in cases {
            assert!(
                matches!(parse_mount_url(&input, "k"), Err(FSError::Permission(_))),
                "failed for case: {}",
                input
            );
        }
    }
}
