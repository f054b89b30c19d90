//! Request signing for the spot API.
//!
//! Two-legged OAuth 1.0a (consumer key and secret, no token). The
//! signature method is `HMAC-SHA1` unless configured otherwise. The
//! transport asks a [`RequestSigner`] for an `Authorization` header and
//! never looks inside it.

use base64::Engine;
use hmac::{Hmac, Mac};
use labstats_config::SignatureMethod;
use rand::Rng;
use sha1::Sha1;
use sha2::Sha256;

type HmacSha1 = Hmac<Sha1>;
type HmacSha256 = Hmac<Sha256>;

/// Produces the `Authorization` header value for one request.
pub trait RequestSigner: Send + Sync {
    fn authorization(&self, method: &str, url: &str) -> String;
}

/// OAuth 1.0a consumer-only signer.
#[derive(Clone)]
pub struct OAuth1Signer {
    consumer_key: String,
    consumer_secret: String,
    method: SignatureMethod,
}

impl std::fmt::Debug for OAuth1Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Signer")
            .field("consumer_key", &self.consumer_key)
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

impl OAuth1Signer {
    pub fn new(consumer_key: impl Into<String>, consumer_secret: impl Into<String>) -> Self {
        OAuth1Signer {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            method: SignatureMethod::default(),
        }
    }

    pub fn with_method(mut self, method: SignatureMethod) -> Self {
        self.method = method;
        self
    }

    /// Header for a fixed nonce and timestamp.
    pub fn sign_with(&self, method: &str, url: &str, nonce: &str, timestamp: i64) -> String {
        let mut oauth_params = vec![
            ("oauth_consumer_key", self.consumer_key.clone()),
            ("oauth_nonce", nonce.to_string()),
            ("oauth_signature_method", self.method.as_str().to_string()),
            ("oauth_timestamp", timestamp.to_string()),
            ("oauth_version", "1.0".to_string()),
        ];

        let base = signature_base_string(method, url, &oauth_params);
        let key = format!("{}&", percent_encode(&self.consumer_secret));
        let signature = hmac_base64(self.method, key.as_bytes(), base.as_bytes());
        oauth_params.push(("oauth_signature", signature));

        let fields: Vec<String> = oauth_params
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, percent_encode(v)))
            .collect();
        format!("OAuth {}", fields.join(", "))
    }
}

impl RequestSigner for OAuth1Signer {
    fn authorization(&self, method: &str, url: &str) -> String {
        self.sign_with(method, url, &nonce(), chrono::Utc::now().timestamp())
    }
}

fn nonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn hmac_base64(method: SignatureMethod, key: &[u8], message: &[u8]) -> String {
    // HMAC accepts keys of any length, so the constructors cannot fail.
    let digest = match method {
        SignatureMethod::HmacSha1 => HmacSha1::new_from_slice(key).map(|mut mac| {
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }),
        SignatureMethod::HmacSha256 => HmacSha256::new_from_slice(key).map(|mut mac| {
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }),
    };
    match digest {
        Ok(bytes) => base64::engine::general_purpose::STANDARD.encode(bytes),
        Err(_) => String::new(),
    }
}

/// `METHOD&enc(base url)&enc(sorted, encoded params)`.
fn signature_base_string(method: &str, url: &str, oauth_params: &[(&str, String)]) -> String {
    let (base_url, query) = match url.split_once('?') {
        Some((base, query)) => (base, query),
        None => (url, ""),
    };
    let base_url = base_url.split('#').next().unwrap_or(base_url);

    let mut params: Vec<(String, String)> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (
                percent_encode(&percent_decode(k)),
                percent_encode(&percent_decode(v)),
            )
        })
        .collect();
    params.extend(
        oauth_params
            .iter()
            .map(|(k, v)| (percent_encode(k), percent_encode(v))),
    );
    params.sort();

    let normalized: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!(
        "{}&{}&{}",
        method.to_ascii_uppercase(),
        percent_encode(base_url),
        percent_encode(&normalized.join("&"))
    )
}

/// RFC 3986 unreserved-set encoding.
pub fn percent_encode(segment: &str) -> String {
    let mut encoded = String::with_capacity(segment.len());
    for &byte in segment.as_bytes() {
        if matches!(byte,
            b'A'..=b'Z'
                | b'a'..=b'z'
                | b'0'..=b'9'
                | b'-'
                | b'_'
                | b'.'
                | b'~'
        ) {
            encoded.push(byte as char);
        } else {
            encoded.push('%');
            encoded.push_str(&format!("{:02X}", byte));
        }
    }
    encoded
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(value) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(value);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_encode_unreserved_passthrough() {
        assert_eq!(percent_encode("abc-XYZ_0.9~"), "abc-XYZ_0.9~");
        assert_eq!(percent_encode("a b:c/d"), "a%20b%3Ac%2Fd");
        assert_eq!(percent_encode("é"), "%C3%A9");
    }

    #[test]
    fn percent_decode_handles_escapes() {
        assert_eq!(
            percent_decode("extended_info%3Ahas_labstats"),
            "extended_info:has_labstats"
        );
        assert_eq!(percent_decode("100%"), "100%");
        assert_eq!(percent_decode("%zz"), "%zz");
    }

    #[test]
    fn base_string_sorts_query_and_oauth_params() {
        let base = signature_base_string(
            "get",
            "http://spot.test/api/v1/spot/?extended_info:has_labstats=true",
            &[("oauth_nonce", "n".to_string())],
        );
        assert_eq!(
            base,
            "GET&http%3A%2F%2Fspot.test%2Fapi%2Fv1%2Fspot%2F&\
             extended_info%253Ahas_labstats%3Dtrue%26oauth_nonce%3Dn"
        );
    }

    const CANDIDATES: &str = "http://spot.test/api/v1/spot/?extended_info:has_labstats=true";

    #[test]
    fn known_signature_defaults_to_sha1() {
        let signer = OAuth1Signer::new("key", "secret");
        let header = signer.sign_with("GET", CANDIDATES, "abc123", 1_700_000_000);
        assert!(header.starts_with("OAuth oauth_consumer_key=\"key\""));
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA1\""));
        assert!(
            header.contains("oauth_signature=\"EZFruvvuBSFcmaui%2FlPKhn2nacY%3D\""),
            "{header}"
        );
    }

    #[test]
    fn known_signature_sha256() {
        let signer = OAuth1Signer::new("key", "secret").with_method(SignatureMethod::HmacSha256);
        let header = signer.sign_with("GET", CANDIDATES, "abc123", 1_700_000_000);
        assert!(header.contains("oauth_signature_method=\"HMAC-SHA256\""));
        assert!(
            header.contains(
                "oauth_signature=\"E8P28oxcCbMMWyLMuTujIZ%2BHd1cp%2B%2Bsdw5ylmahb%2Bu0%3D\""
            ),
            "{header}"
        );
    }

    #[test]
    fn fresh_nonce_per_request() {
        let signer = OAuth1Signer::new("key", "secret");
        let a = signer.authorization("GET", "http://spot.test/");
        let b = signer.authorization("GET", "http://spot.test/");
        assert_ne!(a, b);
        assert_eq!(nonce().len(), 32);
    }

    #[test]
    fn debug_hides_secret() {
        let signer = OAuth1Signer::new("key", "hunter2");
        assert!(!format!("{:?}", signer).contains("hunter2"));
    }
}
