//! Body field extraction, one extractor per declared content type.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tracing::debug;

use super::jwt::claim_to_string;

/// Reads one field out of a request body.
#[async_trait]
pub trait BodyExtractor: Send + Sync {
    /// Extract `field` from `body`. `content_type` is the request's own
    /// `Content-Type` header, needed for parameters such as a multipart
    /// boundary.
    async fn extract(&self, body: &Bytes, field: &str, content_type: Option<&str>) -> Option<String>;
}

/// Supported body formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFormat {
    Json,
    Form,
    Multipart,
    Xml,
}

impl BodyFormat {
    /// Map a content type (parameters ignored) to a format. Anything that
    /// is not form, multipart or XML is read as JSON.
    pub fn from_content_type(content_type: &str) -> Self {
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if essence.contains("x-www-form-urlencoded") {
            BodyFormat::Form
        } else if essence.contains("multipart/form-data") {
            BodyFormat::Multipart
        } else if essence.contains("xml") {
            BodyFormat::Xml
        } else {
            BodyFormat::Json
        }
    }

    pub fn extractor(self) -> &'static dyn BodyExtractor {
        match self {
            BodyFormat::Json => &JsonExtractor,
            BodyFormat::Form => &FormExtractor,
            BodyFormat::Multipart => &MultipartExtractor,
            BodyFormat::Xml => &XmlExtractor,
        }
    }
}

/// Dotted path lookup (`user.id`, `items.0.sku`).
pub struct JsonExtractor;

#[async_trait]
impl BodyExtractor for JsonExtractor {
    async fn extract(&self, body: &Bytes, field: &str, _content_type: Option<&str>) -> Option<String> {
        let root: Value = match serde_json::from_slice(body) {
            Ok(root) => root,
            Err(e) => {
                debug!(error = %e, "Body is not JSON");
                return None;
            }
        };

        let mut current = &root;
        for part in field.split('.') {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        claim_to_string(current)
    }
}

/// `application/x-www-form-urlencoded` field lookup by name.
pub struct FormExtractor;

#[async_trait]
impl BodyExtractor for FormExtractor {
    async fn extract(&self, body: &Bytes, field: &str, _content_type: Option<&str>) -> Option<String> {
        url::form_urlencoded::parse(body)
            .find(|(name, _)| name == field)
            .map(|(_, value)| value.into_owned())
            .filter(|value| !value.is_empty())
    }
}

/// `multipart/form-data` text field lookup by name.
pub struct MultipartExtractor;

#[async_trait]
impl BodyExtractor for MultipartExtractor {
    async fn extract(&self, body: &Bytes, field: &str, content_type: Option<&str>) -> Option<String> {
        let boundary = match content_type.map(multer::parse_boundary) {
            Some(Ok(boundary)) => boundary,
            _ => {
                debug!("Multipart body without a boundary");
                return None;
            }
        };

        let chunk = body.clone();
        let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(chunk) });
        let mut multipart = multer::Multipart::new(stream, boundary);

        loop {
            match multipart.next_field().await {
                Ok(Some(part)) if part.name() == Some(field) => {
                    return part
                        .text()
                        .await
                        .ok()
                        .map(|text| text.trim().to_string())
                        .filter(|text| !text.is_empty());
                }
                Ok(Some(_)) => continue,
                Ok(None) => return None,
                Err(e) => {
                    debug!(error = %e, "Malformed multipart body");
                    return None;
                }
            }
        }
    }
}

/// XPath-style lookup supporting `/`, `//` and bare element names.
///
/// `//client/id` finds any `client` element and takes its `id` child;
/// `apiKey` is read as `//apiKey`. The first match in document order wins.
pub struct XmlExtractor;

#[derive(Debug, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

fn parse_xpath(path: &str) -> Vec<(Axis, &str)> {
    let mut rest = path.trim().trim_end_matches("/text()");

    let mut steps = Vec::new();
    while !rest.is_empty() {
        let (axis, after) = if let Some(after) = rest.strip_prefix("//") {
            (Axis::Descendant, after)
        } else if let Some(after) = rest.strip_prefix('/') {
            (Axis::Child, after)
        } else {
            // a bare leading name searches the whole document
            (Axis::Descendant, rest)
        };
        let end = after.find('/').unwrap_or(after.len());
        let name = &after[..end];
        if !name.is_empty() {
            steps.push((axis, name));
        }
        rest = &after[end..];
    }
    steps
}

fn name_matches(node: &roxmltree::Node<'_, '_>, name: &str) -> bool {
    node.is_element() && (name == "*" || node.tag_name().name() == name)
}

#[async_trait]
impl BodyExtractor for XmlExtractor {
    async fn extract(&self, body: &Bytes, field: &str, _content_type: Option<&str>) -> Option<String> {
        let text = std::str::from_utf8(body).ok()?;
        let doc = match roxmltree::Document::parse(text) {
            Ok(doc) => doc,
            Err(e) => {
                debug!(error = %e, "Body is not XML");
                return None;
            }
        };

        let steps = parse_xpath(field);
        if steps.is_empty() {
            return None;
        }

        let mut current = vec![doc.root()];
        for (axis, name) in &steps {
            let mut next = Vec::new();
            for node in &current {
                match axis {
                    Axis::Child => next.extend(node.children().filter(|n| name_matches(n, name))),
                    Axis::Descendant => next.extend(
                        node.descendants()
                            .skip(1)
                            .filter(|n| name_matches(n, name)),
                    ),
                }
            }
            next.sort_by_key(|n| n.id().get());
            next.dedup_by_key(|n| n.id().get());
            current = next;
        }

        let node = current.first()?;
        let value: String = node
            .descendants()
            .filter(|n| n.is_text())
            .filter_map(|n| n.text())
            .collect();
        let value = value.trim();
        (!value.is_empty()).then(|| value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn extract(format: BodyFormat, body: &str, field: &str, ct: Option<&str>) -> Option<String> {
        format
            .extractor()
            .extract(&Bytes::from(body.to_string()), field, ct)
            .await
    }

    #[test]
    fn test_format_selection() {
        assert_eq!(BodyFormat::from_content_type("application/json"), BodyFormat::Json);
        assert_eq!(
            BodyFormat::from_content_type("application/x-www-form-urlencoded; charset=UTF-8"),
            BodyFormat::Form
        );
        assert_eq!(
            BodyFormat::from_content_type("multipart/form-data; boundary=xyz"),
            BodyFormat::Multipart
        );
        assert_eq!(BodyFormat::from_content_type("text/xml"), BodyFormat::Xml);
        assert_eq!(BodyFormat::from_content_type("text/plain"), BodyFormat::Json);
    }

    #[tokio::test]
    async fn test_json_dotted_path() {
        let body = r#"{"user":{"id":"u-1","tier":3},"items":[{"sku":"a"}],"flag":true}"#;
        assert_eq!(extract(BodyFormat::Json, body, "user.id", None).await.as_deref(), Some("u-1"));
        assert_eq!(extract(BodyFormat::Json, body, "user.tier", None).await.as_deref(), Some("3"));
        assert_eq!(extract(BodyFormat::Json, body, "items.0.sku", None).await.as_deref(), Some("a"));
        assert_eq!(extract(BodyFormat::Json, body, "flag", None).await.as_deref(), Some("true"));
        assert_eq!(extract(BodyFormat::Json, body, "user.missing", None).await, None);
        assert_eq!(extract(BodyFormat::Json, "not json", "user", None).await, None);
    }

    #[tokio::test]
    async fn test_form_field() {
        let body = "api_key=abc%20123&action=test&empty=";
        assert_eq!(extract(BodyFormat::Form, body, "api_key", None).await.as_deref(), Some("abc 123"));
        assert_eq!(extract(BodyFormat::Form, body, "empty", None).await, None);
        assert_eq!(extract(BodyFormat::Form, body, "missing", None).await, None);
    }

    #[tokio::test]
    async fn test_multipart_field() {
        let body = "--XyZ\r\n\
Content-Disposition: form-data; name=\"other\"\r\n\r\n\
ignored\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"client_id\"\r\n\r\n\
client-42\r\n\
--XyZ--\r\n";
        let ct = Some("multipart/form-data; boundary=XyZ");
        assert_eq!(
            extract(BodyFormat::Multipart, body, "client_id", ct).await.as_deref(),
            Some("client-42")
        );
        assert_eq!(extract(BodyFormat::Multipart, body, "nope", ct).await, None);
        assert_eq!(extract(BodyFormat::Multipart, body, "client_id", None).await, None);
    }

    #[tokio::test]
    async fn test_xml_xpath() {
        let body = "<request><client><id>c-7</id></client><meta><id>m-1</id></meta></request>";
        assert_eq!(extract(BodyFormat::Xml, body, "//client/id", None).await.as_deref(), Some("c-7"));
        assert_eq!(extract(BodyFormat::Xml, body, "/request/meta/id", None).await.as_deref(), Some("m-1"));
        assert_eq!(extract(BodyFormat::Xml, body, "id", None).await.as_deref(), Some("c-7"));
        assert_eq!(extract(BodyFormat::Xml, body, "/client/id", None).await, None);
        assert_eq!(extract(BodyFormat::Xml, "<broken", "id", None).await, None);
    }

    #[tokio::test]
    async fn test_xml_nested_matches_in_document_order() {
        // Both <group> elements reach the same <user>; it must be found once
        let body = "<r><group><group><user>u-1</user></group></group><user>u-2</user></r>";
        assert_eq!(extract(BodyFormat::Xml, body, "//group//user", None).await.as_deref(), Some("u-1"));
        assert_eq!(extract(BodyFormat::Xml, body, "//user", None).await.as_deref(), Some("u-1"));
    }

    #[test]
    fn test_parse_xpath() {
        assert_eq!(
            parse_xpath("//client/id"),
            vec![(Axis::Descendant, "client"), (Axis::Child, "id")]
        );
        assert_eq!(
            parse_xpath("/a/b"),
            vec![(Axis::Child, "a"), (Axis::Child, "b")]
        );
        assert_eq!(parse_xpath("apiKey"), vec![(Axis::Descendant, "apiKey")]);
    }
}
