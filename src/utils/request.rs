//! Request target and header helpers used by the client surface.

use http::{uri::PathAndQuery, HeaderMap, Uri};

use crate::core::{RequestError, RequestResult};

/// Resolve a request target against an optional base URI.
///
/// Absolute targets (with scheme and authority) are used as-is. A target
/// starting with `/` replaces the base path; any other relative target is
/// appended to the base path as a child segment.
pub fn resolve_target(base: Option<&Uri>, target: &str) -> RequestResult<Uri> {
    match target.parse::<Uri>() {
        Ok(parsed) if parsed.scheme().is_some() => {
            if parsed.authority().is_none() {
                return Err(RequestError::InvalidTarget(format!(
                    "{target}: missing authority"
                )));
            }
            return Ok(parsed);
        }
        Err(e) if has_scheme(target) => {
            return Err(RequestError::InvalidTarget(format!("{target}: {e}")))
        }
        _ => {}
    }

    let base = base.ok_or_else(|| {
        RequestError::InvalidTarget(format!("{target}: relative target without a base URL"))
    })?;

    let path_and_query = if target.starts_with('/') {
        target.to_string()
    } else {
        let base_path = base.path().trim_end_matches('/');
        format!("{base_path}/{target}")
    };

    let path_and_query = path_and_query
        .parse::<PathAndQuery>()
        .map_err(|e| RequestError::InvalidTarget(format!("{target}: {e}")))?;

    let mut parts = base.clone().into_parts();
    parts.path_and_query = Some(path_and_query);
    Uri::from_parts(parts).map_err(|e| RequestError::InvalidTarget(format!("{target}: {e}")))
}

/// Whether `target` opens with `scheme://`.
fn has_scheme(target: &str) -> bool {
    target.split_once("://").is_some_and(|(scheme, _)| {
        scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
    })
}

/// Overlay `overrides` on `base`. Every header name present in `overrides`
/// replaces all of its values in `base`.
pub fn merge_headers(base: &HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    let mut merged = base.clone();
    for name in overrides.keys() {
        merged.remove(name);
        for value in overrides.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }
    merged
}

/// Whether requests with this method conventionally carry a body.
pub fn method_expects_body(method: &http::Method) -> bool {
    matches!(
        *method,
        http::Method::POST | http::Method::PUT | http::Method::PATCH
    )
}
