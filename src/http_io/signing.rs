//! AWS SigV4 request signing (§4.4: "authentication headers (AWS SigV4 over the
//! canonical request)").

use crate::credentials::Credentials;
use crate::error::{Result, StoreError};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// The headers and query the caller must attach to the outgoing request. Kept as plain
/// data (rather than mutating a `reqwest::Request` directly) so the signer has no
/// dependency on the HTTP client type.
pub struct SignedHeaders {
    pub authorization: String,
    pub x_amz_date: String,
    pub x_amz_content_sha256: String,
    pub x_amz_security_token: Option<String>,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Sorts a `&`-joined, already-percent-encoded query string by parameter name (ties
/// broken by value), as SigV4's canonical request requires. S3 re-sorts the query
/// string it actually received before checking the signature, so signing over an
/// unsorted string only happens to match when the caller already sorted it — any
/// paginated call that appends parameters out of order (e.g. a continuation token
/// added after the initial parameters) would otherwise sign the wrong string.
fn canonical_query_string(query_string: &str) -> String {
    if query_string.is_empty() {
        return String::new();
    }
    let mut params: Vec<&str> = query_string.split('&').collect();
    params.sort_unstable();
    params.join("&")
}

/// Signs a request for `method` against `host` + `canonical_uri`, returning the headers
/// to attach. `canonical_uri` must already be URI-encoded per path-segment.
pub fn sign(
    credentials: &Credentials,
    region: &str,
    method: &str,
    host: &str,
    canonical_uri: &str,
    query_string: &str,
    extra_headers: &[(&str, &str)],
    payload: &[u8],
    now: chrono::DateTime<chrono::Utc>,
) -> Result<SignedHeaders> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = now.format("%Y%m%d").to_string();
    let payload_hash = sha256_hex(payload);

    let mut signed_header_names = vec!["host", "x-amz-content-sha256", "x-amz-date"];
    let mut header_lines = vec![
        format!("host:{host}"),
        format!("x-amz-content-sha256:{payload_hash}"),
        format!("x-amz-date:{amz_date}"),
    ];
    if credentials.session_token.is_some() {
        signed_header_names.push("x-amz-security-token");
    }
    for (name, _) in extra_headers {
        signed_header_names.push(name);
    }
    signed_header_names.sort_unstable();
    signed_header_names.dedup();

    // Rebuild header_lines in the same sorted order as signed_header_names so the
    // canonical headers block and the signed-headers list stay consistent.
    let mut all_headers: Vec<(String, String)> = vec![
        ("host".into(), host.to_string()),
        ("x-amz-content-sha256".into(), payload_hash.clone()),
        ("x-amz-date".into(), amz_date.clone()),
    ];
    if let Some(token) = &credentials.session_token {
        all_headers.push(("x-amz-security-token".into(), token.clone()));
    }
    for (name, value) in extra_headers {
        all_headers.push((name.to_lowercase(), value.to_string()));
    }
    all_headers.sort_by(|a, b| a.0.cmp(&b.0));
    header_lines = all_headers
        .iter()
        .map(|(k, v)| format!("{k}:{v}"))
        .collect();

    let canonical_headers = header_lines.join("\n") + "\n";
    let signed_headers = signed_header_names.join(";");

    let canonical_request = format!(
        "{method}\n{uri}\n{query}\n{headers}\n{signed}\n{payload_hash}",
        method = method,
        uri = canonical_uri,
        query = canonical_query_string(query_string),
        headers = canonical_headers,
        signed = signed_headers,
        payload_hash = payload_hash,
    );

    let credential_scope = format!("{date_stamp}/{region}/s3/aws4_request");
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{hash}",
        amz_date = amz_date,
        scope = credential_scope,
        hash = sha256_hex(canonical_request.as_bytes()),
    );

    let k_date = hmac_sha256(format!("AWS4{}", credentials.secret_key).as_bytes(), date_stamp.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    let k_signing = hmac_sha256(&k_service, b"aws4_request");
    let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes()));

    let authorization = format!(
        "AWS4-HMAC-SHA256 Credential={access}/{scope}, SignedHeaders={signed}, Signature={sig}",
        access = credentials.access_key,
        scope = credential_scope,
        signed = signed_headers,
        sig = signature,
    );

    if authorization.len() > 8192 {
        return Err(StoreError::auth("signed authorization header unexpectedly large"));
    }

    Ok(SignedHeaders {
        authorization,
        x_amz_date: amz_date,
        x_amz_content_sha256: payload_hash,
        x_amz_security_token: credentials.session_token.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn signature_is_deterministic_for_fixed_inputs() {
        let creds = Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "wJalrXUtnFEMI/K7MDENG/bPxRfiCYEXAMPLEKEY".into(),
            session_token: None,
        };
        let now = chrono::Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap();
        let a = sign(&creds, "us-east-1", "GET", "example.amazonaws.com", "/", "", &[], b"", now).unwrap();
        let b = sign(&creds, "us-east-1", "GET", "example.amazonaws.com", "/", "", &[], b"", now).unwrap();
        assert_eq!(a.authorization, b.authorization);
    }

    #[test]
    fn query_parameters_are_signed_in_sorted_order_regardless_of_call_order() {
        let creds = Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "secret".into(),
            session_token: None,
        };
        let now = chrono::Utc::now();
        // Mirrors list_keys appending continuation-token after list-type/prefix, which
        // sorts after "list-type" but before "prefix" alphabetically.
        let unsorted = "list-type=2&prefix=x&continuation-token=abc";
        let sorted = "continuation-token=abc&list-type=2&prefix=x";
        let a = sign(&creds, "us-east-1", "GET", "bucket.s3.amazonaws.com", "/", unsorted, &[], b"", now).unwrap();
        let b = sign(&creds, "us-east-1", "GET", "bucket.s3.amazonaws.com", "/", sorted, &[], b"", now).unwrap();
        assert_eq!(a.authorization, b.authorization);
    }

    #[test]
    fn different_payloads_sign_differently() {
        let creds = Credentials {
            access_key: "AKIDEXAMPLE".into(),
            secret_key: "secret".into(),
            session_token: None,
        };
        let now = chrono::Utc::now();
        let a = sign(&creds, "us-east-1", "PUT", "bucket.s3.amazonaws.com", "/key", "", &[], b"payload-a", now).unwrap();
        let b = sign(&creds, "us-east-1", "PUT", "bucket.s3.amazonaws.com", "/key", "", &[], b"payload-b", now).unwrap();
        assert_ne!(a.authorization, b.authorization);
    }
}
