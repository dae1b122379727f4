//! AWS Signature Version 4 request signing.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use time::macros::format_description;
use time::OffsetDateTime;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AwsSignerConfig {
    #[serde(default, alias = "Region")]
    pub region: String,
    #[serde(default, alias = "Service")]
    pub service: String,
}

#[derive(Debug, Clone)]
pub struct AwsCredentials {
    pub access_key: String,
    pub secret_key: String,
}

#[derive(thiserror::Error, Debug)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    Key(String),
    #[error("failed to format signing date: {0}")]
    Date(#[from] time::error::Format),
    #[error("request URL `{0}` has no host")]
    MissingHost(String),
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SigningError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|err| SigningError::Key(err.to_string()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub fn signing_key(
    secret_key: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, SigningError> {
    let k_date = hmac(format!("AWS4{secret_key}").as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

fn canonical_uri(url: &Url, service: &str) -> String {
    let path = match url.path() {
        "" => "/",
        path => path,
    };
    if service == "s3" {
        path.to_string()
    } else {
        uri_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (uri_encode(&k, true), uri_encode(&v, true)))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn host_header(url: &Url) -> Result<String, SigningError> {
    let host = url
        .host_str()
        .ok_or_else(|| SigningError::MissingHost(url.to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Computes the headers to add to a request so that it carries a SigV4 signature.
///
/// `headers` are the caller-provided headers that should be covered by the
/// signature (for example `content-type`). The returned list contains
/// `x-amz-date`, `x-amz-content-sha256` for S3, and `authorization`.
pub fn sign(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    payload: &[u8],
    credentials: &AwsCredentials,
    config: &AwsSignerConfig,
    now: OffsetDateTime,
) -> Result<Vec<(String, String)>, SigningError> {
    let amz_date = now.format(format_description!(
        "[year][month][day]T[hour][minute][second]Z"
    ))?;
    let date = &amz_date[..8];
    let payload_hash = sha256_hex(payload);

    let mut added = vec![("x-amz-date".to_string(), amz_date.clone())];
    if config.service == "s3" {
        added.push(("x-amz-content-sha256".to_string(), payload_hash.clone()));
    }

    let mut signed: Vec<(String, String)> = headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        .chain(std::iter::once(("host".to_string(), host_header(url)?)))
        .chain(added.iter().cloned())
        .collect();
    signed.sort_by(|a, b| a.0.cmp(&b.0));
    signed.dedup_by(|a, b| a.0 == b.0);

    let canonical_headers: String = signed
        .iter()
        .map(|(name, value)| format!("{name}:{value}\n"))
        .collect();
    let signed_headers = signed
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
        canonical_uri(url, &config.service),
        canonical_query(url),
    );
    let scope = format!("{date}/{}/{}/aws4_request", config.region, config.service);
    let string_to_sign = format!(
        "{ALGORITHM}\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let key = signing_key(&credentials.secret_key, date, &config.region, &config.service)?;
    let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

    added.push((
        "authorization".to_string(),
        format!(
            "{ALGORITHM} Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            credentials.access_key
        ),
    ));
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn derives_documented_signing_key() {
        let key = signing_key(
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            "20150830",
            "us-east-1",
            "iam",
        )
        .unwrap();
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn signs_documented_get_request() {
        let url = Url::parse("https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08").unwrap();
        let headers = vec![(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )];
        let added = sign(
            "GET",
            &url,
            &headers,
            b"",
            &AwsCredentials {
                access_key: "AKIDEXAMPLE".to_string(),
                secret_key: "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY".to_string(),
            },
            &AwsSignerConfig {
                region: "us-east-1".to_string(),
                service: "iam".to_string(),
            },
            datetime!(2015-08-30 12:36:00 UTC),
        )
        .unwrap();

        assert_eq!(added[0], ("x-amz-date".to_string(), "20150830T123600Z".to_string()));
        assert_eq!(
            added.last().unwrap().1,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
    }

    #[test]
    fn s3_adds_content_hash_header() {
        let url = Url::parse("https://bucket.s3.amazonaws.com/key").unwrap();
        let added = sign(
            "PUT",
            &url,
            &[],
            b"data",
            &AwsCredentials {
                access_key: "a".to_string(),
                secret_key: "b".to_string(),
            },
            &AwsSignerConfig {
                region: "eu-west-1".to_string(),
                service: "s3".to_string(),
            },
            datetime!(2024-01-01 00:00:00 UTC),
        )
        .unwrap();
        assert_eq!(added[1].0, "x-amz-content-sha256");
        assert_eq!(added[1].1, sha256_hex(b"data"));
        assert!(added[2].1.contains("SignedHeaders=host;x-amz-content-sha256;x-amz-date"));
    }

    #[test]
    fn query_is_sorted_and_encoded() {
        let url = Url::parse("https://h/p?b=2&a=hello%20world").unwrap();
        assert_eq!(canonical_query(&url), "a=hello%20world&b=2");
    }
}
