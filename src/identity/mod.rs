//! Identifier resolution: which key a request is counted against.

mod body;
mod jwt;
mod resolver;

pub use body::{BodyExtractor, BodyFormat, FormExtractor, JsonExtractor, MultipartExtractor, XmlExtractor};
pub use jwt::UnverifiedClaims;
pub use resolver::{IdentifierResolver, Identity, IdentitySource, RequestView};

pub(crate) use resolver::cookie_value;
