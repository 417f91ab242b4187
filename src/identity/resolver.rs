//! Rate limit key derivation.

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE};
use axum::http::HeaderMap;
use bytes::Bytes;
use std::fmt;
use std::net::IpAddr;
use tracing::trace;

use super::body::BodyFormat;
use super::jwt::UnverifiedClaims;
use crate::rules::{CompiledRule, LimitType};

/// Where an identifier came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    Ip,
    Jwt,
    Header,
    Cookie,
    Body,
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IdentitySource::Ip => "ip",
            IdentitySource::Jwt => "jwt",
            IdentitySource::Header => "header",
            IdentitySource::Cookie => "cookie",
            IdentitySource::Body => "body",
        };
        f.write_str(name)
    }
}

/// The key a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub key: String,
    pub source: IdentitySource,
}

/// The parts of a request the resolver looks at.
#[derive(Debug, Clone, Copy)]
pub struct RequestView<'a> {
    pub client_ip: IpAddr,
    pub headers: &'a HeaderMap,
    pub body: &'a Bytes,
}

/// Resolves identifiers from JWT claims, a header, a cookie or a body field,
/// in that order. The first non-empty value wins; otherwise the caller's IP
/// is the key. Extraction failures never surface as errors.
#[derive(Debug, Clone, Default)]
pub struct IdentifierResolver {
    claims: UnverifiedClaims,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, rule: &CompiledRule, request: &RequestView<'_>) -> Identity {
        let spec = &rule.rule.spec;
        let ip = request.client_ip.to_string();

        if spec.jwt_enabled {
            let value = header_str(request.headers, AUTHORIZATION.as_str())
                .and_then(|auth| self.claims.extract(auth, &rule.claims, rule.rule.claim_separator()));
            if let Some(value) = value {
                return identity(IdentitySource::Jwt, value, LimitType::ReplaceIp, &ip);
            }
        }

        if spec.header_limit_enabled {
            let value = spec
                .header_name
                .as_deref()
                .and_then(|name| header_str(request.headers, name))
                .map(str::trim)
                .filter(|v| !v.is_empty());
            if let Some(value) = value {
                let mode = spec.header_limit_type.unwrap_or_default();
                return identity(IdentitySource::Header, value.to_string(), mode, &ip);
            }
        }

        if spec.cookie_limit_enabled {
            let value = spec
                .cookie_name
                .as_deref()
                .and_then(|name| cookie_value(request.headers, name));
            if let Some(value) = value {
                let mode = spec.cookie_limit_type.unwrap_or_default();
                return identity(IdentitySource::Cookie, value, mode, &ip);
            }
        }

        if spec.body_limit_enabled && !request.body.is_empty() {
            if let Some(field) = spec.body_field_path.as_deref().filter(|f| !f.is_empty()) {
                let request_type = header_str(request.headers, CONTENT_TYPE.as_str());
                let declared = spec.body_content_type.as_deref().or(request_type);
                let format = declared
                    .map(BodyFormat::from_content_type)
                    .unwrap_or(BodyFormat::Json);

                let value = format
                    .extractor()
                    .extract(request.body, field, request_type)
                    .await;
                if let Some(value) = value {
                    let mode = spec.body_limit_type.unwrap_or_default();
                    return identity(IdentitySource::Body, value, mode, &ip);
                }
            }
        }

        trace!(rule_id = %rule.id(), ip = %ip, "Falling back to IP identifier");
        Identity {
            key: ip,
            source: IdentitySource::Ip,
        }
    }
}

fn identity(source: IdentitySource, value: String, mode: LimitType, ip: &str) -> Identity {
    let key = match mode {
        LimitType::ReplaceIp => value,
        LimitType::CombineWithIp => format!("{}:{}", ip, value),
    };
    trace!(source = %source, key = %key, "Resolved identifier");
    Identity { key, source }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Find a cookie by name across all `Cookie` headers.
pub(crate) fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| k.trim() == name)
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|v| !v.is_empty())
}
