use crate::{
    error::ProxyError,
    example::Example,
    request::NormalizedRequest,
    store::ExampleStore,
};

/// Evaluates every stored example under `namespace` against the request.
///
/// Zero matches is not an error; the caller proceeds to forward. More than
/// one match aborts the request: picking one silently would make replay
/// depend on store enumeration order.
///
/// Every request re-lists and re-loads the full example set; the store holds
/// fixture-scale data and there is no cache to invalidate.
pub fn find_match(
    store: &dyn ExampleStore,
    namespace: &str,
    request: &NormalizedRequest,
) -> Result<Option<Example>, ProxyError> {
    let keys = store.list(namespace)?;

    let mut matched = Vec::new();
    for key in keys {
        let bytes = store.read(&key)?;
        let example = Example::from_unit_bytes(&key, &bytes)?;
        if example.matches(request) {
            matched.push(example);
        }
    }

    match matched.len() {
        0 => Ok(None),
        1 => Ok(matched.pop()),
        _ => Err(ProxyError::AmbiguousMatch {
            keys: matched.into_iter().map(|example| example.key().to_owned()).collect(),
        }),
    }
}
