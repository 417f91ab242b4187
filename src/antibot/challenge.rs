//! Proof-of-browser challenge responses.

use axum::http::header::{CONTENT_TYPE, SET_COOKIE};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::time::Duration;

/// Cookie carrying a challenge token back on the next request.
pub const CHALLENGE_COOKIE: &str = "X-Form-Token-Challenge";

/// A challenge issued by `/api/tokens/challenge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// HTML page that reloads `redirect_path` after `delay_secs`, with the
    /// token set as a cookie
    MetaRefresh {
        token: String,
        delay_secs: u64,
        redirect_path: String,
        cookie_max_age: Duration,
    },
    /// Bare token for script-driven clients
    Token { token: String },
}

impl Challenge {
    pub fn token(&self) -> &str {
        match self {
            Challenge::MetaRefresh { token, .. } | Challenge::Token { token } => token,
        }
    }

    /// `Set-Cookie` value for meta-refresh challenges.
    pub fn cookie(&self) -> Option<String> {
        match self {
            Challenge::MetaRefresh {
                token,
                cookie_max_age,
                ..
            } => Some(format!(
                "{}={}; Path=/; Max-Age={}",
                CHALLENGE_COOKIE,
                token,
                cookie_max_age.as_secs()
            )),
            Challenge::Token { .. } => None,
        }
    }

    fn html(delay_secs: u64, redirect_path: &str) -> String {
        let url = escape_html(redirect_path);
        format!(
            r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="UTF-8">
  <meta http-equiv="refresh" content="{delay}; url={url}">
  <title>Please wait...</title>
  <style>
    body {{ font-family: Arial, sans-serif; display: flex; align-items: center; justify-content: center; height: 100vh; background: #f5f5f5; margin: 0; }}
    .box {{ text-align: center; background: white; padding: 40px; border-radius: 8px; }}
  </style>
</head>
<body>
  <div class="box">
    <h1>Verifying your browser...</h1>
    <p>This page will refresh in {delay} seconds.</p>
    <p><a href="{url}">Continue</a></p>
  </div>
</body>
</html>
"#,
            delay = delay_secs,
            url = url
        )
    }
}

impl IntoResponse for Challenge {
    fn into_response(self) -> Response {
        let cookie = self.cookie();
        let mut response = match self {
            Challenge::MetaRefresh {
                delay_secs,
                redirect_path,
                ..
            } => (
                StatusCode::OK,
                [(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"))],
                Challenge::html(delay_secs, &redirect_path),
            )
                .into_response(),
            Challenge::Token { token } => Json(json!({ "token": token })).into_response(),
        };

        if let Some(value) = cookie.and_then(|c| HeaderValue::from_str(&c).ok()) {
            response.headers_mut().insert(SET_COOKIE, value);
        }
        response
    }
}

fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}
