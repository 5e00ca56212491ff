//! Per-provider refresh-token grants. Amazon Q goes through the AWS SSO OIDC
//! endpoint with the official CLI's header set; Gemini goes through Google
//! OAuth. Custom-API accounts hold a static key and never refresh.

use serde::Deserialize;
use uuid::Uuid;

use crate::constants::{
    AMAZONQ_AMZ_USER_AGENT, AMAZONQ_TOKEN_URL, AMAZONQ_USER_AGENT, GOOGLE_TOKEN_URL,
};
use crate::models::{Account, AccountType};

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct AmazonQTokenResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken", default)]
    refresh_token: Option<String>,
    #[serde(rename = "expiresIn", default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub async fn refresh_credentials(
    http: &reqwest::Client,
    account: &Account,
) -> Result<RefreshOutcome, String> {
    match account.account_type {
        AccountType::AmazonQ => refresh_amazon_q(http, account).await,
        AccountType::Gemini => refresh_gemini(http, account).await,
        AccountType::CustomApi => Err("custom_api accounts hold a static key".to_string()),
    }
}

async fn refresh_amazon_q(
    http: &reqwest::Client,
    account: &Account,
) -> Result<RefreshOutcome, String> {
    let payload = serde_json::json!({
        "grantType": "refresh_token",
        "refreshToken": account.refresh_token,
        "clientId": account.client_id,
        "clientSecret": account.client_secret,
    });

    let response = http
        .post(AMAZONQ_TOKEN_URL)
        .header("Content-Type", "application/json")
        .header("User-Agent", AMAZONQ_USER_AGENT)
        .header("X-Amz-User-Agent", AMAZONQ_AMZ_USER_AGENT)
        .header("Amz-Sdk-Request", "attempt=1; max=3")
        .header("Amz-Sdk-Invocation-Id", Uuid::new_v4().to_string())
        .json(&payload)
        .send()
        .await
        .map_err(|e| format!("Refresh request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP error {}: {}", status.as_u16(), body));
    }

    let parsed: AmazonQTokenResponse = response
        .json()
        .await
        .map_err(|e| format!("Refresh data parsing failed: {}", e))?;
    if parsed.access_token.is_empty() {
        return Err("Response missing accessToken".to_string());
    }
    Ok(RefreshOutcome {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_in: parsed.expires_in.unwrap_or(3600),
    })
}

async fn refresh_gemini(
    http: &reqwest::Client,
    account: &Account,
) -> Result<RefreshOutcome, String> {
    let params = [
        ("client_id", account.client_id.as_str()),
        ("client_secret", account.client_secret.as_str()),
        ("refresh_token", account.refresh_token.as_str()),
        ("grant_type", "refresh_token"),
    ];

    let response = http
        .post(GOOGLE_TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| format!("Refresh request failed: {}", e))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(format!("HTTP error {}: {}", status.as_u16(), body));
    }

    let parsed: GoogleTokenResponse = response
        .json()
        .await
        .map_err(|e| format!("Refresh data parsing failed: {}", e))?;
    Ok(RefreshOutcome {
        access_token: parsed.access_token,
        refresh_token: parsed.refresh_token,
        expires_in: parsed.expires_in.unwrap_or(3600),
    })
}

/// Pull the `exp` claim out of a JWT access token without verifying the
/// signature; we only issue a refresh off it, never trust it for auth.
pub fn jwt_expiry(token: &str) -> Option<i64> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    let mut segments = token.split('.');
    let _header = segments.next()?;
    let claims_b64 = segments.next()?;
    segments.next()?; // signature segment must exist for this to be a JWT
    let claims_raw = URL_SAFE_NO_PAD.decode(claims_b64).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&claims_raw).ok()?;
    claims.get("exp").and_then(|v| v.as_i64())
}

/// Provider markers in 401/403 bodies that mean the token itself is bad and
/// a re-refresh (not a different account) is the right response.
pub fn is_token_invalid_body(body: &str) -> bool {
    body.contains("AccessDeniedException")
        || body.contains("ExpiredTokenException")
        || body.contains("UNAUTHENTICATED")
        || body.contains("invalid_token")
        || body.contains("Token has expired")
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine as _;

    fn make_jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes());
        format!("{}.{}.sig", header, payload)
    }

    #[test]
    fn jwt_expiry_reads_exp_claim() {
        let token = make_jwt(serde_json::json!({"sub": "abc", "exp": 1_999_999_999}));
        assert_eq!(jwt_expiry(&token), Some(1_999_999_999));
    }

    #[test]
    fn jwt_expiry_rejects_opaque_tokens() {
        assert_eq!(jwt_expiry("aoa-not-a-jwt"), None);
        assert_eq!(jwt_expiry("two.parts"), None);
    }

    #[test]
    fn token_invalid_markers() {
        assert!(is_token_invalid_body(
            r#"{"__type":"AccessDeniedException","message":"..."}"#
        ));
        assert!(is_token_invalid_body(r#"{"error":{"status":"UNAUTHENTICATED"}}"#));
        assert!(!is_token_invalid_body(r#"{"error":"quota exceeded"}"#));
    }
}
