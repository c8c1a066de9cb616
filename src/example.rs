use bytes::Bytes;
use hyper::{HeaderMap, StatusCode, header::HeaderName, header::HeaderValue};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{error::ProxyError, request::NormalizedRequest};

/// On-disk shape of a persisted example: a data-only match rule plus the
/// captured response. The rule is interpreted by [`Example::matches`]; no
/// executable logic is ever loaded from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredExample {
    pub when: MatchRule,
    pub response: StoredResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchRule {
    pub method: String,
    pub url_pattern: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    pub headers: Vec<(String, StoredValue)>,
    pub body: StoredValue,
    pub format: BodyFormat,
}

/// Header values and bodies are text when they are valid UTF-8 and raw byte
/// arrays otherwise, so stored units stay human-readable for the common case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl StoredValue {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self::Text(text.to_owned()),
            Err(_) => Self::Bytes(bytes.to_vec()),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

/// Display/formatting hint for the stored body; carries no matching semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyFormat {
    #[serde(rename = "JSON")]
    Json,
    #[serde(rename = "XML")]
    Xml,
}

impl BodyFormat {
    pub fn detect(body: &[u8]) -> Self {
        if serde_json::from_slice::<serde_json::Value>(body).is_ok() {
            Self::Json
        } else {
            Self::Xml
        }
    }
}

/// A stored example loaded into evaluable form: the rule's regex compiled and
/// the response descriptor converted back to protocol types.
#[derive(Debug)]
pub struct Example {
    key: String,
    method: String,
    url_regex: Regex,
    response: ResponseDescriptor,
}

#[derive(Debug, Clone)]
pub struct ResponseDescriptor {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Example {
    /// Loads a unit read from the store. Any failure (unparseable JSON, an
    /// invalid pattern, a status or header that protocol types reject) is a
    /// [`ProxyError::CorruptExample`]: a broken unit means the store is
    /// inconsistent and must not be skipped over.
    pub fn from_unit_bytes(key: &str, bytes: &[u8]) -> Result<Self, ProxyError> {
        let corrupt = |reason: String| ProxyError::CorruptExample {
            key: key.to_owned(),
            reason,
        };

        let stored: StoredExample = serde_json::from_slice(bytes)
            .map_err(|err| corrupt(format!("parse unit JSON: {err}")))?;
        let url_regex = Regex::new(&stored.when.url_pattern)
            .map_err(|err| corrupt(format!("compile url pattern: {err}")))?;
        let status = StatusCode::from_u16(stored.response.status)
            .map_err(|err| corrupt(format!("invalid status code: {err}")))?;

        let mut headers = HeaderMap::new();
        for (name, value) in stored.response.headers {
            let header_name = name
                .parse::<HeaderName>()
                .map_err(|err| corrupt(format!("invalid header name `{name}`: {err}")))?;
            let header_value = HeaderValue::from_bytes(&value.into_bytes())
                .map_err(|err| corrupt(format!("invalid value for header `{name}`: {err}")))?;
            headers.append(header_name, header_value);
        }

        Ok(Self {
            key: key.to_owned(),
            method: stored.when.method,
            url_regex,
            response: ResponseDescriptor {
                status,
                headers,
                body: Bytes::from(stored.response.body.into_bytes()),
            },
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// The fixed predicate interpreter: the request method must equal the
    /// recorded method, and the decoded full URL must match the recorded
    /// scheme-agnostic pattern.
    pub fn matches(&self, request: &NormalizedRequest) -> bool {
        self.method.eq_ignore_ascii_case(request.method().as_str())
            && self.url_regex.is_match(&decode_url(&request.full_url()))
    }

    pub fn into_response(self) -> ResponseDescriptor {
        self.response
    }
}

/// Builds the match predicate expression for a recorded URL: decoded,
/// regex-escaped, anchored, with the scheme token made scheme-agnostic so a
/// request recorded under `https` also matches an incoming `http` variant.
pub fn url_pattern(url: &str) -> String {
    let escaped = regex::escape(&decode_url(url));
    let agnostic = if let Some(rest) = escaped.strip_prefix("https:") {
        format!("https?:{rest}")
    } else if let Some(rest) = escaped.strip_prefix("http:") {
        format!("https?:{rest}")
    } else {
        escaped
    };
    format!("^{agnostic}$")
}

/// Percent-decodes, then resolves the predefined HTML entities. Both the
/// recorded URL and the URL under evaluation pass through here, so encoding
/// differences never break structural equality.
pub fn decode_url(url: &str) -> String {
    entity_decode(&percent_decode(url))
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%'
            && idx + 2 < bytes.len()
            && let (Some(high), Some(low)) = (hex_digit(bytes[idx + 1]), hex_digit(bytes[idx + 2]))
        {
            out.push(high << 4 | low);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

fn entity_decode(input: &str) -> String {
    const ENTITIES: [(&str, &str); 5] = [
        ("&amp;", "&"),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&#039;", "'"),
    ];
    let mut out = input.to_owned();
    for (entity, replacement) in ENTITIES {
        if out.contains(entity) {
            out = out.replace(entity, replacement);
        }
    }
    out
}
