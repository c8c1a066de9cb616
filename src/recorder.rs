use hyper::{HeaderMap, header};

use crate::{
    error::ProxyError,
    example::{self, BodyFormat, MatchRule, StoredExample, StoredResponse, StoredValue},
    proxy::CapturedResponse,
    request::NormalizedRequest,
    slug,
    store::{ExampleStore, StoreError},
};

const UNIT_SUFFIX: &str = ".inc";

/// Derives the canonical storage key for a request:
/// `<namespace>/<service-slug>/<METHOD> <basename-slug>.inc`.
///
/// Only host, method, and endpoint basename participate, so requests that
/// differ in query string or body still key to the same unit: recording is
/// one-example-per-(service, method, endpoint).
pub fn storage_key(namespace: &str, request: &NormalizedRequest) -> String {
    let service = slug::service_slug(request.host());
    let basename = slug::slug(&endpoint_basename(request));
    format!(
        "{namespace}/{service}/{} {basename}{UNIT_SUFFIX}",
        request.method()
    )
}

/// The endpoint basename of the request URL: the last path segment, skipping
/// trailing purely-numeric id segments (`/v1/users/42` and `/v1/users/43`
/// both name the `users` endpoint). Falls back to the host for bare roots.
fn endpoint_basename(request: &NormalizedRequest) -> String {
    let segments: Vec<&str> = request
        .url()
        .path()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();

    segments
        .iter()
        .rev()
        .find(|segment| segment.bytes().any(|byte| byte.is_ascii_alphabetic()))
        .or_else(|| segments.last())
        .map(|segment| (*segment).to_owned())
        .unwrap_or_else(|| request.host().to_owned())
}

/// Persists the forwarded exchange as a new example. Recording never
/// overwrites: an occupied key is a hard [`ProxyError::DuplicateExample`],
/// both on the existence pre-check and on the exclusive-create write that
/// settles concurrent recorders of the same key.
pub fn record(
    store: &dyn ExampleStore,
    namespace: &str,
    request: &NormalizedRequest,
    response: &CapturedResponse,
) -> Result<String, ProxyError> {
    let key = storage_key(namespace, request);
    if store.exists(&key)? {
        return Err(ProxyError::DuplicateExample { key });
    }

    let unit = StoredExample {
        when: MatchRule {
            method: request.method().to_string(),
            url_pattern: example::url_pattern(&request.full_url()),
        },
        response: StoredResponse {
            status: response.status.as_u16(),
            headers: normalized_stored_headers(&response.headers, response.body.len()),
            body: StoredValue::from_bytes(&response.body),
            format: BodyFormat::detect(&response.body),
        },
    };
    let bytes = serde_json::to_vec_pretty(&unit).map_err(|err| ProxyError::StoreFailure {
        reason: format!("serialize example unit: {err}"),
    })?;

    match store.write_new(&key, &bytes) {
        Ok(()) => Ok(key),
        Err(StoreError::AlreadyExists(key)) => Err(ProxyError::DuplicateExample { key }),
        Err(err) => Err(err.into()),
    }
}

/// Stored headers stay consistent with the stored body: whatever length the
/// upstream claimed is dropped in favor of the captured byte count.
fn normalized_stored_headers(headers: &HeaderMap, body_len: usize) -> Vec<(String, StoredValue)> {
    let mut out: Vec<(String, StoredValue)> = headers
        .iter()
        .filter(|(name, _)| {
            **name != header::CONTENT_LENGTH && **name != header::TRANSFER_ENCODING
        })
        .map(|(name, value)| {
            (name.as_str().to_owned(), StoredValue::from_bytes(value.as_bytes()))
        })
        .collect();
    out.push((
        header::CONTENT_LENGTH.as_str().to_owned(),
        StoredValue::Text(body_len.to_string()),
    ));
    out
}
