use std::collections::BTreeMap;

pub(super) fn has_header(headers: &[(String, String)], name: &str) -> bool {
    headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
}

/// `Host` header value. Default ports are omitted.
pub(super) fn host_header_value(parsed: &url::Url) -> Option<String> {
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host.to_string()),
    }
}

/// Path and query of `parsed`, as sent on the request line.
pub(super) fn origin_form(parsed: &url::Url) -> &str {
    &parsed[url::Position::BeforePath..url::Position::AfterQuery]
}

/// Lowercases header names and joins repeated values with ", ".
pub(super) fn merge_headers(headers: &http::HeaderMap) -> Vec<(String, String)> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let key = name.as_str().to_ascii_lowercase();
        let v = String::from_utf8_lossy(value.as_bytes()).to_string();
        merged
            .entry(key)
            .and_modify(|cur| {
                if !cur.is_empty() {
                    cur.push_str(", ");
                }
                cur.push_str(&v);
            })
            .or_insert(v);
    }
    merged.into_iter().collect()
}
