//! OAuth 1.0a request signing (HMAC-SHA1 / HMAC-SHA256).

use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use sluice_core::integration::Oauth1Signature;
use sluice_error::DeliveryError;

/// Inputs for signing one request
#[derive(Debug, Clone)]
pub struct Oauth1Request<'a> {
    /// Consumer key
    pub consumer_key:     &'a str,
    /// Consumer secret
    pub consumer_secret:  &'a str,
    /// Access token, when present
    pub token:            Option<&'a str>,
    /// Access token secret
    pub token_secret:     Option<&'a str>,
    /// Realm attribute
    pub realm:            Option<&'a str>,
    /// Signature method
    pub signature_method: Oauth1Signature,
}

/// Build the `Authorization: OAuth ...` header for a request.
///
/// `nonce` and `timestamp` are injected so signing is deterministic under
/// test; production callers pass a random nonce and the current unix time.
pub fn authorization_header(
    request: &Oauth1Request<'_>,
    http_method: &str,
    url: &str,
    nonce: &str,
    timestamp: i64,
) -> Result<String, DeliveryError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| DeliveryError::Config {
        reason: format!("OAuth1 target URL is invalid: {e}"),
    })?;

    let method_name = match request.signature_method {
        Oauth1Signature::HmacSha1 => "HMAC-SHA1",
        Oauth1Signature::HmacSha256 => "HMAC-SHA256",
    };

    let timestamp = timestamp.to_string();
    let mut params: Vec<(String, String)> = vec![
        ("oauth_consumer_key".to_string(), request.consumer_key.to_string()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        ("oauth_signature_method".to_string(), method_name.to_string()),
        ("oauth_timestamp".to_string(), timestamp),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];
    if let Some(token) = request.token {
        params.push(("oauth_token".to_string(), token.to_string()));
    }

    // Query parameters participate in the signature base string
    let mut all_params: Vec<(String, String)> = params.clone();
    for (k, v) in parsed.query_pairs() {
        all_params.push((k.into_owned(), v.into_owned()));
    }

    let mut encoded: Vec<(String, String)> = all_params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    let mut base_url = parsed.clone();
    base_url.set_query(None);
    base_url.set_fragment(None);

    let base_string = format!(
        "{}&{}&{}",
        http_method.to_uppercase(),
        percent_encode(base_url.as_str()),
        percent_encode(&param_string)
    );

    let signing_key = format!(
        "{}&{}",
        percent_encode(request.consumer_secret),
        percent_encode(request.token_secret.unwrap_or(""))
    );

    let signature = sign(request.signature_method, &signing_key, &base_string);

    let mut header_params = params;
    header_params.push(("oauth_signature".to_string(), signature));

    let rendered = header_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(match request.realm {
        Some(realm) => format!("OAuth realm=\"{realm}\", {rendered}"),
        None => format!("OAuth {rendered}"),
    })
}

fn sign(method: Oauth1Signature, key: &str, base: &str) -> String {
    let engine = base64::engine::general_purpose::STANDARD;
    match method {
        Oauth1Signature::HmacSha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(base.as_bytes());
            engine.encode(mac.finalize().into_bytes())
        },
        Oauth1Signature::HmacSha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
                .expect("HMAC accepts keys of any length");
            mac.update(base.as_bytes());
            engine.encode(mac.finalize().into_bytes())
        },
    }
}

/// RFC 3986 percent encoding with the unreserved set.
#[must_use]
pub fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(byte as char);
            },
            other => {
                out.push('%');
                out.push_str(&format!("{other:02X}"));
            },
        }
    }
    out
}
