use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri, header, http::uri};

/// An inbound request canonicalized for matching, forwarding, and recording.
///
/// The URL is absolute and scheme-normalized: an `http` scheme is rewritten to
/// `https` before any use, so the upstream is always reached securely. Method,
/// query, headers, and body pass through unchanged in content.
#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    method: Method,
    url: Uri,
    headers: HeaderMap,
    body: Bytes,
}

impl NormalizedRequest {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Uri {
        &self.url
    }

    /// The full URL as a string, the form predicates are recorded against.
    pub fn full_url(&self) -> String {
        self.url.to_string()
    }

    pub fn host(&self) -> &str {
        self.url.host().unwrap_or_default()
    }

    /// Query parameters in request order; repeated names are preserved.
    pub fn query_pairs(&self) -> Vec<(&str, &str)> {
        let Some(query) = self.url.query() else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|segment| !segment.is_empty())
            .map(|segment| segment.split_once('=').unwrap_or((segment, "")))
            .collect()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }
}

/// Canonicalizes an inbound request. Best-effort: malformed input is carried
/// through as-is rather than rejected.
///
/// Origin-form targets (`GET /path`) are resolved against the `Host` header
/// into an absolute URL; absolute-form (proxy-style) targets are used as-is.
/// Either way an `http` scheme becomes `https`; other schemes are untouched.
pub fn normalize(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> NormalizedRequest {
    let method = uppercase_method(method);
    let url = secure_scheme(absolute_url(uri, &headers));
    NormalizedRequest {
        method,
        url,
        headers,
        body,
    }
}

fn uppercase_method(method: Method) -> Method {
    let name = method.as_str();
    if name.bytes().any(|byte| byte.is_ascii_lowercase()) {
        Method::from_bytes(name.to_ascii_uppercase().as_bytes()).unwrap_or(method)
    } else {
        method
    }
}

fn absolute_url(uri: Uri, headers: &HeaderMap) -> Uri {
    if uri.authority().is_some() {
        return uri;
    }
    let Some(authority) = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|host| host.parse::<uri::Authority>().ok())
    else {
        return uri;
    };

    let mut parts = uri::Parts::default();
    parts.scheme = Some(uri::Scheme::HTTP);
    parts.authority = Some(authority);
    parts.path_and_query = Some(
        uri.path_and_query()
            .cloned()
            .unwrap_or_else(|| uri::PathAndQuery::from_static("/")),
    );
    Uri::from_parts(parts).unwrap_or(uri)
}

fn secure_scheme(uri: Uri) -> Uri {
    if uri.scheme_str() != Some("http") {
        return uri;
    }
    let mut parts = uri.clone().into_parts();
    parts.scheme = Some(uri::Scheme::HTTPS);
    Uri::from_parts(parts).unwrap_or(uri)
}
