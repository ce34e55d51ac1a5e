//! Wire types and endpoint layout of the device API

use crate::ClientError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Setup (key exchange) endpoint
pub const SETUP_PATH: &str = "/api/setup";

/// Display (image refresh) endpoint
pub const DISPLAY_PATH: &str = "/api/display";

pub const HEADER_ID: &str = "ID";
pub const HEADER_ACCESS_TOKEN: &str = "Access-Token";
pub const HEADER_REFRESH_RATE: &str = "Refresh-Rate";

/// Body returned by the setup endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupResponse {
    /// Application status, `200` on success. Must be a JSON integer.
    pub status: i64,

    #[serde(default)]
    pub image_url: String,

    #[serde(default)]
    pub api_key: String,
}

impl SetupResponse {
    pub const SUCCESS: i64 = 200;

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

/// Body returned by the display endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayResponse {
    /// Application status, `0` on success
    pub status: i64,

    #[serde(default)]
    pub image_url: String,

    /// Seconds until the next refresh; servers send either a number or a string
    #[serde(default)]
    pub refresh_rate: Option<Value>,
}

impl DisplayResponse {
    pub const SUCCESS: i64 = 0;

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }

    /// Refresh rate in seconds, if the server sent a usable one
    pub fn refresh_rate_secs(&self) -> Option<u64> {
        self.refresh_rate.as_ref().and_then(parse_refresh_rate)
    }
}

/// Resolve an API path against the configured server URL.
///
/// The path is absolute, so any path component of `server_url` is replaced.
pub fn endpoint(server_url: &str, path: &str) -> Result<Url, ClientError> {
    let base = Url::parse(server_url)?;
    Ok(base.join(path)?)
}

/// Interpret a `refresh_rate` value as whole seconds.
///
/// Numbers are truncated; strings are read up to the first non-digit after
/// optional leading whitespace and `+`. Negative, empty and non-numeric values
/// yield `None`.
pub fn parse_refresh_rate(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => {
            if let Some(secs) = n.as_u64() {
                return Some(secs);
            }
            n.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0 && *f < u64::MAX as f64)
                .map(|f| f.trunc() as u64)
        }
        Value::String(s) => {
            let s = s.trim_start();
            let s = s.strip_prefix('+').unwrap_or(s);
            let end = s
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(s.len());
            s[..end].parse().ok()
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_join() {
        let url = endpoint("https://x.test", SETUP_PATH).unwrap();
        assert_eq!(url.as_str(), "https://x.test/api/setup");

        // Absolute path replaces whatever path the server URL carried
        let url = endpoint("https://x.test/some/prefix/", DISPLAY_PATH).unwrap();
        assert_eq!(url.as_str(), "https://x.test/api/display");

        let url = endpoint("http://127.0.0.1:8080", DISPLAY_PATH).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8080/api/display");
    }

    #[test]
    fn test_endpoint_rejects_relative_server() {
        let err = endpoint("x.test", SETUP_PATH).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_parse_refresh_rate_strings() {
        assert_eq!(parse_refresh_rate(&json!("300")), Some(300));
        assert_eq!(parse_refresh_rate(&json!("  60")), Some(60));
        assert_eq!(parse_refresh_rate(&json!("+45")), Some(45));
        assert_eq!(parse_refresh_rate(&json!("120s")), Some(120));
        assert_eq!(parse_refresh_rate(&json!("0")), Some(0));
        assert_eq!(parse_refresh_rate(&json!("")), None);
        assert_eq!(parse_refresh_rate(&json!("soon")), None);
        assert_eq!(parse_refresh_rate(&json!("-30")), None);
    }

    #[test]
    fn test_parse_refresh_rate_numbers() {
        assert_eq!(parse_refresh_rate(&json!(900)), Some(900));
        assert_eq!(parse_refresh_rate(&json!(12.7)), Some(12));
        assert_eq!(parse_refresh_rate(&json!(-5)), None);
        assert_eq!(parse_refresh_rate(&json!(null)), None);
        assert_eq!(parse_refresh_rate(&json!(true)), None);
    }

    #[test]
    fn test_setup_response_parsing() {
        let body = r#"{"status":200,"image_url":"https://x.test/a.png","api_key":"k1"}"#;
        let setup: SetupResponse = serde_json::from_str(body).unwrap();
        assert!(setup.is_success());
        assert_eq!(setup.api_key, "k1");
        assert_eq!(setup.image_url, "https://x.test/a.png");
    }

    #[test]
    fn test_display_response_sentinel_differs_from_setup() {
        let display: DisplayResponse =
            serde_json::from_str(r#"{"status":0,"image_url":"b.png","refresh_rate":"300"}"#)
                .unwrap();
        assert!(display.is_success());
        assert_eq!(display.refresh_rate_secs(), Some(300));

        let display: DisplayResponse = serde_json::from_str(r#"{"status":200}"#).unwrap();
        assert!(!display.is_success());
        assert_eq!(display.refresh_rate_secs(), None);
    }

    #[test]
    fn test_status_must_be_integer() {
        for body in [
            r#"{"status":"200","api_key":"k1"}"#,
            r#"{"status":200.0,"api_key":"k1"}"#,
            r#"{"api_key":"k1"}"#,
        ] {
            assert!(serde_json::from_str::<SetupResponse>(body).is_err(), "{}", body);
        }

        assert!(serde_json::from_str::<DisplayResponse>(r#"{"status":"0"}"#).is_err());
    }
}
