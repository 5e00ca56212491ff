//! Upstream endpoints and wire-level constants.

/// Amazon Q / CodeWhisperer streaming endpoint.
pub const AMAZONQ_API_URL: &str = "https://q.us-east-1.amazonaws.com/";
pub const AMAZONQ_TARGET: &str =
    "AmazonCodeWhispererStreamingService.GenerateAssistantResponse";
pub const AMAZONQ_CONTENT_TYPE: &str = "application/x-amz-json-1.0";

/// Amazon Q OIDC endpoints (device-code flow and refresh).
pub const AMAZONQ_TOKEN_URL: &str = "https://oidc.us-east-1.amazonaws.com/token";
pub const AMAZONQ_DEVICE_AUTH_URL: &str =
    "https://oidc.us-east-1.amazonaws.com/device_authorization";
pub const AMAZONQ_CLIENT_REGISTER_URL: &str =
    "https://oidc.us-east-1.amazonaws.com/client/register";
pub const AMAZONQ_START_URL: &str = "https://view.awsapps.com/start";
pub const AMAZONQ_OIDC_SCOPES: &[&str] = &["codewhisperer:completions", "codewhisperer:analysis"];

/// Request headers mimic the official CLI so the OIDC endpoint accepts us.
pub const AMAZONQ_USER_AGENT: &str = "aws-sdk-rust/1.3.9 os/macos lang/rust/1.87.0";
pub const AMAZONQ_AMZ_USER_AGENT: &str =
    "aws-sdk-rust/1.3.9 ua/2.1 api/ssooidc/1.88.0 os/macos lang/rust/1.87.0 m/E app/AmazonQ-For-CLI";

/// Google OAuth refresh endpoint for Gemini accounts.
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Default Gemini API endpoint; overridable per account via the extension blob.
pub const GEMINI_DEFAULT_ENDPOINT: &str = "https://cloudcode-pa.googleapis.com";
pub const GEMINI_STREAM_PATH: &str = "/v1internal:streamGenerateContent?alt=sse";

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Access tokens with less than this many seconds of life are refreshed.
pub const TOKEN_EXPIRY_SKEW_SECS: i64 = 300;
/// Device-code polling gives up after this many seconds.
pub const DEVICE_AUTH_CEILING_SECS: u64 = 300;
/// Keepalive ping cadence on quiet upstreams.
pub const PING_INTERVAL_SECS: u64 = 15;

pub const DEFAULT_WEIGHT: u32 = 50;
pub const DEFAULT_RATE_LIMIT_PER_HOUR: u32 = 20;
pub const DEFAULT_THINKING_BUDGET: u32 = 1024;

/// Directive appended to prompts when thinking emulation is on; the model is
/// asked to wrap its reasoning in `<thinking>` tags that the stream adapters
/// parse back out.
pub const THINKING_HINT: &str =
    "<thinking_mode>interleaved</thinking_mode><max_thinking_length>16000</max_thinking_length>";
pub const THINKING_START_TAG: &str = "<thinking>";
pub const THINKING_END_TAG: &str = "</thinking>";
