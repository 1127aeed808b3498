use std::sync::Mutex;

use bytes::Bytes;
use http::{Method, Uri};

use crate::endpoint::{Headers, QueryParams};

const MAX_ERROR_BODY_LEN: usize = 2048;
const HTML_DOCTYPE_PREFIX: &str = "<!doctype html>";

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Builds the request target from an absolute URL path and query parameters.
///
/// Parameters are percent-encoded and appended sorted by name, so the same
/// logical request always produces the same target string. When `query` is
/// empty, any query already present on `path` is kept as-is.
pub(crate) fn build_request_target(path: &str, query: &QueryParams) -> Option<Uri> {
    let mut url = url::Url::parse(path).ok()?;
    if !query.is_empty() {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (name, value) in query {
            serializer.append_pair(name, value);
        }
        url.set_query(Some(&serializer.finish()));
    }
    url.as_str().parse().ok()
}

pub(crate) fn merge_headers(default_headers: &Headers, request_headers: &Headers) -> Headers {
    let mut merged = default_headers.clone();
    for (name, value) in request_headers {
        merged.insert(name.clone(), value.clone());
    }
    merged
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let mut cut = MAX_ERROR_BODY_LEN;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

/// Turns a response body into a log/error snippet. Servers behind misrouted
/// proxies answer API calls with HTML error pages; the doctype prefix is
/// stripped so the snippet starts with something readable.
pub(crate) fn stringify_body(body: &[u8]) -> String {
    let text = truncate_body(body);
    match text.strip_prefix(HTML_DOCTYPE_PREFIX) {
        Some(rest) => rest.trim_start().to_owned(),
        None => text,
    }
}

/// Renders a cURL command equivalent to the request, for repro in triage.
pub(crate) fn curl_command(
    method: &Method,
    url: &str,
    headers: &Headers,
    body: Option<&Bytes>,
) -> String {
    let mut command = format!("curl -vX \"{method}\" \"{url}\"");
    for (name, value) in headers {
        command.push_str(" \\\n     -H '");
        command.push_str(name);
        command.push_str(": ");
        command.push_str(value);
        command.push('\'');
    }
    if let Some(body) = body {
        command.push_str(" \\\n     -d $'");
        command.push_str(&String::from_utf8_lossy(body));
        command.push('\'');
    }
    command
}
