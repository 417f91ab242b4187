//! Ratewarden - Rate Limiting and Anti-Bot Gateway
//!
//! This crate implements a reverse proxy that sits in front of backend
//! services. Requests are matched against admin-managed rules, counted per
//! identifier in fixed windows, optionally paced through a per-rule queue
//! instead of being rejected, checked for bot behaviour on state-mutating
//! methods, and finally forwarded to the rule's target.

pub mod analytics;
pub mod antibot;
pub mod config;
pub mod error;
pub mod http;
pub mod identity;
pub mod ratelimit;
pub mod rules;
