//! WebDAV property model and multistatus parsing.

use md5::Md5;
use percent_encoding::percent_decode_str;

use super::TransportError;
use crate::lock::hex_digest;
use crate::types::{FileType, Permissions};

pub const DAV_NS: &str = "DAV:";
pub const OC_NS: &str = "http://owncloud.org/ns";
pub const OCS_NS: &str = "http://open-collaboration-services.org/ns";

/// Body of every PROPFIND request.
pub const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns" xmlns:ocs="http://open-collaboration-services.org/ns">
  <d:prop>
    <d:getlastmodified/>
    <d:getcontentlength/>
    <d:getcontenttype/>
    <oc:permissions/>
    <d:resourcetype/>
    <d:getetag/>
    <d:quota-available-bytes/>
    <ocs:share-permissions/>
  </d:prop>
</d:propfind>"#;

/// ETags longer than this are hashed.
const MAX_ETAG_LENGTH: usize = 40;

/// Properties of one resource, as returned by PROPFIND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavProps {
    pub is_collection: bool,
    pub content_length: Option<u64>,
    pub last_modified: Option<i64>,
    /// Raw `getetag` value, quotes included.
    pub etag: Option<String>,
    pub content_type: Option<String>,
    /// `oc:permissions` string, e.g. `RDNVCK`.
    pub permissions: Option<String>,
    pub share_permissions: Option<u32>,
    pub quota_available: Option<i64>,
}

impl DavProps {
    pub fn file_type(&self) -> FileType {
        if self.is_collection {
            FileType::Directory
        } else {
            FileType::File
        }
    }

    /// Permissions from `oc:permissions`, or the defaults for the resource type.
    pub fn permissions(&self) -> Permissions {
        match &self.permissions {
            Some(raw) => parse_permissions(raw),
            None if self.is_collection => Permissions::ALL,
            None => Permissions::ALL.without(Permissions::CREATE),
        }
    }

    pub fn normalized_etag(&self) -> Option<String> {
        self.etag.as_deref().map(normalize_etag)
    }
}

/// One `<d:response>` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DavResponse {
    /// Storage-relative path of the resource.
    pub path: String,
    pub props: DavProps,
}

/// Decode an `oc:permissions` string.
pub fn parse_permissions(raw: &str) -> Permissions {
    let mut permissions = Permissions::READ;
    if raw.contains('R') {
        permissions |= Permissions::SHARE;
    }
    if raw.contains('D') {
        permissions |= Permissions::DELETE;
    }
    if raw.contains('W') {
        permissions |= Permissions::UPDATE;
    }
    if raw.contains("CK") {
        permissions |= Permissions::CREATE | Permissions::UPDATE;
    }
    permissions
}

/// Strip quotes; hash values too long to store.
pub fn normalize_etag(raw: &str) -> String {
    let trimmed = raw.trim_matches('"');
    if trimmed.len() > MAX_ETAG_LENGTH {
        hex_digest::<Md5>(trimmed.as_bytes())
    } else {
        trimmed.to_string()
    }
}

/// Parse an HTTP date (`Wed, 21 Oct 2015 07:28:00 GMT`) into epoch seconds.
pub fn parse_http_date(raw: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|date| date.timestamp())
}

/// Format epoch seconds as an HTTP date.
pub fn format_http_date(epoch: i64) -> Option<String> {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|date| date.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

/// Map an href onto a path relative to `base_path` (the decoded URL path of
/// the storage root).
pub fn href_to_path(href: &str, base_path: &str) -> String {
    let raw_path = match url::Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    let decoded = percent_decode_str(&raw_path).decode_utf8_lossy();
    let base = base_path.trim_end_matches('/');
    let relative = decoded.strip_prefix(base).unwrap_or(&decoded);
    relative.trim_matches('/').to_string()
}

fn is(node: roxmltree::Node<'_, '_>, ns: &str, name: &str) -> bool {
    node.is_element() && node.tag_name().name() == name && node.tag_name().namespace() == Some(ns)
}

fn child<'a, 'input>(
    node: roxmltree::Node<'a, 'input>,
    ns: &str,
    name: &str,
) -> Option<roxmltree::Node<'a, 'input>> {
    node.children().find(|c| is(*c, ns, name))
}

fn text_of(node: roxmltree::Node<'_, '_>) -> Option<String> {
    let text: String = node
        .descendants()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect();
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn apply_prop(props: &mut DavProps, prop: roxmltree::Node<'_, '_>) {
    let name = prop.tag_name();
    match (name.namespace().unwrap_or_default(), name.name()) {
        (DAV_NS, "resourcetype") => {
            props.is_collection = prop.children().any(|c| is(c, DAV_NS, "collection"));
        }
        (DAV_NS, "getcontentlength") => {
            props.content_length = text_of(prop).and_then(|t| t.parse().ok());
        }
        (DAV_NS, "getlastmodified") => {
            props.last_modified = text_of(prop).and_then(|t| parse_http_date(&t));
        }
        (DAV_NS, "getetag") => props.etag = text_of(prop),
        (DAV_NS, "getcontenttype") => props.content_type = text_of(prop),
        (DAV_NS, "quota-available-bytes") => {
            props.quota_available = text_of(prop).and_then(|t| t.parse().ok());
        }
        (OC_NS, "permissions") => props.permissions = text_of(prop),
        (OCS_NS, "share-permissions") => {
            props.share_permissions = text_of(prop).and_then(|t| t.parse().ok());
        }
        _ => {}
    }
}

/// Parse a 207 multistatus body. Only properties reported with status 200
/// are kept.
pub fn parse_multistatus(xml: &str, base_path: &str) -> Result<Vec<DavResponse>, TransportError> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| TransportError::Malformed(format!("invalid multistatus XML: {}", e)))?;
    let root = doc.root_element();
    if !is(root, DAV_NS, "multistatus") {
        return Err(TransportError::Malformed(format!(
            "expected multistatus, got {}",
            root.tag_name().name()
        )));
    }

    let mut responses = Vec::new();
    for response in root.children().filter(|n| is(*n, DAV_NS, "response")) {
        let href = child(response, DAV_NS, "href")
            .and_then(text_of)
            .ok_or_else(|| TransportError::Malformed("response without href".into()))?;
        let mut props = DavProps::default();
        for propstat in response.children().filter(|n| is(*n, DAV_NS, "propstat")) {
            let succeeded = child(propstat, DAV_NS, "status")
                .and_then(text_of)
                .is_none_or(|status| status.split_whitespace().nth(1) == Some("200"));
            if !succeeded {
                continue;
            }
            if let Some(prop) = child(propstat, DAV_NS, "prop") {
                for entry in prop.children().filter(|n| n.is_element()) {
                    apply_prop(&mut props, entry);
                }
            }
        }
        responses.push(DavResponse {
            path: href_to_path(&href, base_path),
            props,
        });
    }
    Ok(responses)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const LISTING: &str = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns" xmlns:ocs="http://open-collaboration-services.org/ns">
  <d:response>
    <d:href>/remote.php/webdav/docs/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getlastmodified>Wed, 21 Oct 2015 07:28:00 GMT</d:getlastmodified>
        <d:getetag>"5f2a"</d:getetag>
        <oc:permissions>RDNVCK</oc:permissions>
        <d:quota-available-bytes>-3</d:quota-available-bytes>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/webdav/docs/a%20b.txt</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getcontentlength>12</d:getcontentlength>
        <d:getcontenttype>text/plain</d:getcontenttype>
        <ocs:share-permissions>19</ocs:share-permissions>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
    <d:propstat>
      <d:prop><oc:permissions/></d:prop>
      <d:status>HTTP/1.1 404 Not Found</d:status>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_listing() {
        let responses = parse_multistatus(LISTING, "/remote.php/webdav/").unwrap();
        assert_eq!(responses.len(), 2);

        let dir = &responses[0];
        assert_eq!(dir.path, "docs");
        assert!(dir.props.is_collection);
        assert_eq!(dir.props.last_modified, Some(1_445_412_480));
        assert_eq!(dir.props.normalized_etag().as_deref(), Some("5f2a"));
        assert_eq!(dir.props.permissions(), Permissions::ALL);
        assert_eq!(dir.props.quota_available, Some(-3));

        let file = &responses[1];
        assert_eq!(file.path, "docs/a b.txt");
        assert_eq!(file.props.file_type(), FileType::File);
        assert_eq!(file.props.content_length, Some(12));
        assert_eq!(file.props.content_type.as_deref(), Some("text/plain"));
        assert_eq!(file.props.share_permissions, Some(19));
        assert_eq!(file.props.permissions, None);
        assert_eq!(
            file.props.permissions(),
            Permissions::ALL.without(Permissions::CREATE)
        );
    }

    #[test]
    fn test_rejects_html() {
        let err = parse_multistatus("<html><body>down</body></html>", "/").unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
        let err = parse_multistatus("not xml", "/").unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[test]
    fn test_parse_permissions() {
        assert_eq!(parse_permissions(""), Permissions::READ);
        assert_eq!(
            parse_permissions("RD"),
            Permissions::READ | Permissions::SHARE | Permissions::DELETE
        );
        assert_eq!(
            parse_permissions("CK"),
            Permissions::READ | Permissions::CREATE | Permissions::UPDATE
        );
        // C and K must be adjacent.
        assert_eq!(parse_permissions("CNK"), Permissions::READ);
    }

    #[test]
    fn test_normalize_etag() {
        assert_eq!(normalize_etag("\"abc\""), "abc");
        let long = "x".repeat(41);
        let hashed = normalize_etag(&long);
        assert_eq!(hashed.len(), 32);
        assert_ne!(hashed, long);
    }

    #[test]
    fn test_href_variants() {
        assert_eq!(href_to_path("/dav/", "/dav/"), "");
        assert_eq!(href_to_path("https://h/dav/x/y%C3%A9", "/dav/"), "x/yé");
        assert_eq!(href_to_path("/dav", "/dav/"), "");
    }

    #[test]
    fn test_http_date_round_trip() {
        let formatted = format_http_date(1_445_412_480).unwrap();
        assert_eq!(formatted, "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_http_date(&formatted), Some(1_445_412_480));
    }
}
