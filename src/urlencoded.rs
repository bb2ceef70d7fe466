//! Decoding of query strings and `application/x-www-form-urlencoded` bodies.

use std::collections::HashMap;

/// Decodes `%XX` escapes. A `+` is left untouched.
///
/// Returns `None` for a truncated or non-hex escape, or when the decoded
/// bytes are not valid UTF-8.
pub fn percent_decode(input: &str) -> Option<String> {
    let mut result = Vec::with_capacity(input.len());
    let mut bytes = input.bytes();

    while let Some(byte) = bytes.next() {
        if byte == b'%' {
            let high = from_hex_char(bytes.next()?)?;
            let low = from_hex_char(bytes.next()?)?;
            result.push((high << 4) | low);
        } else {
            result.push(byte);
        }
    }

    String::from_utf8(result).ok()
}

fn from_hex_char(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Decodes or keeps the raw text; never fails.
fn unescape(raw: &str) -> String {
    percent_decode(raw).unwrap_or_else(|| raw.to_owned())
}

/// Splits `key=value` on the first `=`; further `=` belong to the value.
/// A missing `=` gives an empty value.
fn split_entry(entry: &str) -> (&str, &str) {
    entry.split_once('=').unwrap_or((entry, ""))
}

/// Decodes the query part of a request path. Duplicate keys keep the last
/// value.
pub fn decode_query(path: &str) -> HashMap<String, String> {
    let mut query = HashMap::new();
    let Some((_, raw)) = path.split_once('?') else {
        return query;
    };
    for entry in raw.split('&') {
        let (key, value) = split_entry(entry);
        query.insert(unescape(key.trim()), unescape(value));
    }
    query
}

/// Decodes a form body. Duplicate keys accumulate, and array-style keys
/// (`list[]`, `m[][]`) are stored under their base name.
pub fn decode_form(body: &str) -> HashMap<String, Vec<String>> {
    let mut form: HashMap<String, Vec<String>> = HashMap::new();
    for entry in body.split('&') {
        // A bare `key` is decoded like any other key and appends "" rather
        // than replacing earlier values.
        let (key, value) = split_entry(entry);
        let key = unescape(key.trim());
        let key = if key.ends_with("[]") {
            key.trim_end_matches(['[', ']']).to_owned()
        } else {
            key
        };
        form.entry(key).or_default().push(unescape(value));
    }
    form
}
