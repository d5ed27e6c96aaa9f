use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use crate::protocol::HeaderMutation;
use crate::{ExtProcError, Result};

type HmacSha256 = Hmac<Sha256>;

/// AWS access key material, static or assumed through STS.
#[derive(Clone, PartialEq, Eq)]
pub struct AwsCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
    pub expires_at: Option<OffsetDateTime>,
}

impl std::fmt::Debug for AwsCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl AwsCredential {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Result<Self> {
        let access_key_id = access_key_id.into();
        let secret_access_key = secret_access_key.into();
        if access_key_id.trim().is_empty() {
            return Err(ExtProcError::Credential(
                "aws access key id is required".to_string(),
            ));
        }
        if secret_access_key.trim().is_empty() {
            return Err(ExtProcError::Credential(
                "aws secret access key is required".to_string(),
            ));
        }
        Ok(Self {
            access_key_id,
            secret_access_key,
            session_token: session_token.filter(|token| !token.trim().is_empty()),
            expires_at: None,
        })
    }

    pub fn with_expiry(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// True when the credential is gone or expires within `window`.
    pub fn expires_within(&self, now: OffsetDateTime, window: time::Duration) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - now <= window)
    }
}

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

        let amz_date = datetime.format(AMZ_FORMAT).map_err(|err| {
            ExtProcError::Credential(format!("failed to format sigv4 amz date: {err}"))
        })?;
        let date = datetime.format(DATE_FORMAT).map_err(|err| {
            ExtProcError::Credential(format!("failed to format sigv4 date: {err}"))
        })?;
        Ok(Self { amz_date, date })
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self> {
        let amz_date = amz_date.trim();
        let date = amz_date.get(..8).ok_or_else(|| {
            ExtProcError::Credential("sigv4 amz date must be at least 8 chars".to_string())
        })?;
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: date.to_string(),
        })
    }
}

/// SigV4 signing scope; the key material is passed per call so the
/// credential can rotate underneath.
#[derive(Debug, Clone)]
pub struct SigV4Signer {
    region: String,
    service: String,
}

impl SigV4Signer {
    pub fn new(region: impl Into<String>, service: impl Into<String>) -> Result<Self> {
        let region = region.into();
        let service = service.into();
        if region.trim().is_empty() {
            return Err(ExtProcError::Credential(
                "sigv4 region is required".to_string(),
            ));
        }
        if service.trim().is_empty() {
            return Err(ExtProcError::Credential(
                "sigv4 service is required".to_string(),
            ));
        }
        Ok(Self { region, service })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn sign(
        &self,
        credential: &AwsCredential,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SignedRequest> {
        let method = method.trim();
        if method.is_empty() {
            return Err(ExtProcError::Credential(
                "sigv4 method must be non-empty".to_string(),
            ));
        }

        let url = Url::parse(url)
            .map_err(|err| ExtProcError::Credential(format!("sigv4 invalid url {url:?}: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| ExtProcError::Credential("sigv4 url missing host".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let payload_hash = sha256_hex(payload);
        let signing_headers = signing_headers(
            headers,
            &host,
            &timestamp.amz_date,
            &payload_hash,
            credential.session_token.as_deref(),
        );
        let signed_headers = signing_headers
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = signing_headers
            .iter()
            .map(|(name, value)| format!("{name}:{value}\n"))
            .collect();
        let canonical_request = format!(
            "{method}\n{}\n{}\n{canonical_headers}\n{signed_headers}\n{payload_hash}",
            canonical_uri(&url),
            canonical_query(&url),
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );

        let mut key = hmac_sha256(
            format!("AWS4{}", credential.secret_access_key).as_bytes(),
            &timestamp.date,
        )?;
        for part in [self.region.as_str(), self.service.as_str(), "aws4_request"] {
            key = hmac_sha256(&key, part)?;
        }
        let signature = hex_encode(&hmac_sha256(&key, &string_to_sign)?);

        Ok(SignedRequest {
            authorization: format!(
                "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
                credential.access_key_id
            ),
            amz_date: timestamp.amz_date,
            content_sha256: payload_hash,
            security_token: credential.session_token.clone(),
            canonical_request,
            string_to_sign,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub security_token: Option<String>,
    pub canonical_request: String,
    pub string_to_sign: String,
}

impl SignedRequest {
    pub fn header_mutation(&self) -> HeaderMutation {
        let mut mutation = HeaderMutation::default();
        mutation.set("authorization", self.authorization.as_str());
        mutation.set("x-amz-date", self.amz_date.as_str());
        mutation.set("x-amz-content-sha256", self.content_sha256.as_str());
        if let Some(token) = self.security_token.as_deref() {
            mutation.set("x-amz-security-token", token);
        }
        mutation
    }
}

/// Lowercased, whitespace-folded headers plus the ones SigV4 always signs.
fn signing_headers(
    headers: &BTreeMap<String, String>,
    host: &str,
    amz_date: &str,
    payload_hash: &str,
    session_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let value = fold_whitespace(value);
        out.entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
    }

    out.entry("host".to_string())
        .or_insert_with(|| host.to_string());
    out.insert("x-amz-date".to_string(), amz_date.to_string());
    out.entry("x-amz-content-sha256".to_string())
        .or_insert_with(|| payload_hash.to_string());
    if let Some(token) = session_token {
        out.insert("x-amz-security-token".to_string(), fold_whitespace(token));
    }
    out
}

fn canonical_uri(url: &Url) -> String {
    match url.path() {
        "" => "/".to_string(),
        path => uri_encode(path, false),
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs = url
        .query_pairs()
        .map(|(name, value)| (uri_encode(&name, true), uri_encode(&value, true)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for &byte in value.as_bytes() {
        let keep = byte.is_ascii_alphanumeric()
            || matches!(byte, b'-' | b'_' | b'.' | b'~')
            || (!encode_slash && byte == b'/');
        if keep {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX_CHARS[(byte >> 4) as usize].to_ascii_uppercase() as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize].to_ascii_uppercase() as char);
        }
    }
    out
}

fn fold_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| ExtProcError::Credential(format!("sigv4 invalid hmac key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex_encode(&Sha256::digest(bytes))
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example_credential() -> AwsCredential {
        AwsCredential::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            None,
        )
        .expect("credential")
    }

    #[test]
    fn matches_aws_reference_signature() -> Result<()> {
        let signer = SigV4Signer::new("us-east-1", "iam")?;
        let headers = BTreeMap::from([(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )]);

        let result = signer.sign(
            &example_credential(),
            "GET",
            "https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08",
            &headers,
            b"",
            SigV4Timestamp::from_amz_date("20150830T123600Z")?,
        )?;

        let expected_canonical = [
            "GET",
            "/",
            "Action=ListUsers&Version=2010-05-08",
            "content-type:application/x-www-form-urlencoded; charset=utf-8",
            "host:iam.amazonaws.com",
            "x-amz-content-sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "x-amz-date:20150830T123600Z",
            "",
            "content-type;host;x-amz-content-sha256;x-amz-date",
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ]
        .join("\n");

        assert_eq!(result.canonical_request, expected_canonical);
        assert_eq!(
            result.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature=dd479fa8a80364edf2119ec24bebde66712ee9c9cb2b0d92eb3ab9ccdc0c3947"
        );
        Ok(())
    }

    #[test]
    fn session_token_is_signed_and_emitted() -> Result<()> {
        let credential = AwsCredential::new("AKID", "secret", Some("session-tok".to_string()))?;
        let signer = SigV4Signer::new("us-west-2", "bedrock")?;
        let signed = signer.sign(
            &credential,
            "POST",
            "https://bedrock-runtime.us-west-2.amazonaws.com/model/anthropic.claude-3:0/converse",
            &BTreeMap::new(),
            br#"{"messages":[]}"#,
            SigV4Timestamp::from_amz_date("20240101T000000Z")?,
        )?;
        assert!(signed.canonical_request.contains("x-amz-security-token:session-tok"));
        assert!(
            signed
                .canonical_request
                .starts_with("POST\n/model/anthropic.claude-3%3A0/converse\n")
        );

        let mutation = signed.header_mutation();
        assert_eq!(
            mutation.get("x-amz-security-token").as_deref(),
            Some("session-tok")
        );
        assert_eq!(mutation.get("x-amz-date").as_deref(), Some("20240101T000000Z"));
        assert!(
            mutation
                .get("authorization")
                .is_some_and(|value| value.contains("/us-west-2/bedrock/aws4_request"))
        );
        Ok(())
    }

    #[test]
    fn expiry_window_is_inclusive() -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let credential = example_credential().with_expiry(now + time::Duration::minutes(5));
        assert!(credential.expires_within(now, time::Duration::minutes(5)));
        assert!(!credential.expires_within(now, time::Duration::minutes(4)));
        assert!(!example_credential().expires_within(now, time::Duration::minutes(5)));
        Ok(())
    }

    #[test]
    fn debug_redacts_secrets() {
        let credential =
            AwsCredential::new("AKID", "very-secret", Some("tok".to_string())).expect("credential");
        let debug = format!("{credential:?}");
        assert!(!debug.contains("very-secret"));
        assert!(!debug.contains("\"tok\""));
    }
}
