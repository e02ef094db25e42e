//! HTTP body / environment parsers (C5): incremental parsers for
//! `application/x-www-form-urlencoded` bodies, `multipart/form-data`
//! (with nested `multipart/mixed`), and `Cookie:` headers, plus the small
//! ordered multimaps these populate. Driven record-by-record by the
//! request state machine (`crate::request`) on the `PARAMS` and `STDIN`
//! streams.

mod codec;
pub mod cookie;
pub mod multipart;
pub mod urlencoded;

use std::collections::HashMap;

pub use cookie::{Cookie, CookieJar};
pub use multipart::{EntryBody, MixedEntry, MultipartEntry, MultipartParser};
pub use urlencoded::UrlEncodedParser;

/// An insertion-order-preserving multimap: each key can carry several
/// values (repeated query params, multiple cookies of the same name). A
/// plain `Vec` keeps the per-name order without pulling in an external
/// ordered-map crate for something this small.
#[derive(Debug, Clone, Default)]
pub struct MultiMap<V> {
    order: Vec<String>,
    values: HashMap<String, Vec<V>>,
}

impl<V> MultiMap<V> {
    pub fn new() -> Self {
        MultiMap {
            order: Vec::new(),
            values: HashMap::new(),
        }
    }

    pub fn push(&mut self, key: impl Into<String>, value: V) {
        let key = key.into();
        if !self.values.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.values.entry(key).or_default().push(value);
    }

    pub fn get(&self, key: &str) -> Option<&[V]> {
        self.values.get(key).map(|v| v.as_slice())
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Iterate `(name, values)` in the order each name was first seen.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[V])> {
        self.order
            .iter()
            .map(move |k| (k.as_str(), self.values[k].as_slice()))
    }
}

/// Per-request environment and parsed form data, populated by the
/// `PARAMS`/`STDIN` phase of the request state machine.
#[derive(Debug, Default)]
pub struct Environment {
    /// CGI-style variables retained by the user's `params_handler`.
    pub envs: MultiMap<String>,
    /// Parsed `QUERY_STRING`.
    pub gets: MultiMap<String>,
    /// Parsed `multipart/form-data` (or urlencoded) body entries.
    pub posts: MultiMap<MultipartEntry>,
    /// Parsed nested `multipart/mixed` entries.
    pub mm_posts: MultiMap<MixedEntry>,
    /// Parsed `Cookie:` header.
    pub cookies: CookieJar,
}

/// Which incremental body parser, if any, `CONTENT_TYPE` armed.
#[derive(Debug)]
pub enum BodyParser {
    None,
    UrlEncoded(UrlEncodedParser),
    Multipart(Box<MultipartParser>),
}

/// Strip RFC-2822 `(comment)` runs and unwrap a quoted-string, used when
/// extracting `boundary=...` (and similar) attributes from `Content-Type`.
pub fn strip_comments_and_unquote(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0i32;
    let mut chars = s.chars().peekable();
    let mut in_quotes = false;
    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
                continue;
            }
            if c == '"' {
                in_quotes = false;
                continue;
            }
            out.push(c);
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' if depth > 0 => depth -= 1,
            '"' if depth == 0 => in_quotes = true,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

/// Extract an attribute (e.g. `boundary=`, `charset=`) from a
/// `Content-Type`-style parameter list, honoring quoted-string values: the
/// raw substring is located first (so a `;` embedded in a quoted value
/// isn't mistaken for the parameter separator), and only that substring is
/// then unquoted.
pub fn extract_attribute(content_type: &str, attr: &str) -> Option<String> {
    let needle = format!("{attr}=").to_ascii_lowercase();
    let lower = content_type.to_ascii_lowercase();
    let pos = lower.find(&needle)?;
    let rest = &content_type[pos + needle.len()..];
    let raw_value = extract_raw_value(rest);
    Some(strip_comments_and_unquote(raw_value).trim().to_string())
}

/// The raw, still-possibly-quoted substring of one parameter value: up to
/// the closing `"` of a quoted-string (backslash-escaped quotes don't
/// close it), or up to the next unquoted `;` otherwise.
fn extract_raw_value(rest: &str) -> &str {
    let rest = rest.trim_start();
    let bytes = rest.as_bytes();
    if bytes.first() == Some(&b'"') {
        let mut i = 1;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() => i += 2,
                b'"' => return &rest[..=i],
                _ => i += 1,
            }
        }
        return rest;
    }
    let end = rest.find(';').unwrap_or(rest.len());
    &rest[..end]
}

/// Does `content_type` start with `prefix`, ignoring case? `CONTENT_TYPE`
/// often carries trailing parameters (`; boundary=...`, `; charset=...`)
/// that a prefix match should ignore.
pub fn starts_with_ci(content_type: &str, prefix: &str) -> bool {
    content_type
        .get(..prefix.len())
        .map(|head| head.eq_ignore_ascii_case(prefix))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_boundary_attribute() {
        let ct = r#"multipart/form-data; boundary="XYZ123""#;
        assert_eq!(extract_attribute(ct, "boundary"), Some("XYZ123".to_string()));
    }

    #[test]
    fn strips_comment_before_boundary() {
        let ct = "multipart/form-data (ignore me); boundary=ABC";
        assert_eq!(extract_attribute(ct, "boundary"), Some("ABC".to_string()));
    }

    #[test]
    fn quoted_value_with_embedded_semicolon_is_not_truncated() {
        let ct = r#"multipart/form-data; boundary="AB;CD""#;
        assert_eq!(extract_attribute(ct, "boundary"), Some("AB;CD".to_string()));
    }

    #[test]
    fn unquoted_attribute_after_a_quoted_one_is_still_found() {
        let ct = r#"multipart/form-data; boundary="XY;Z"; charset=utf-8"#;
        assert_eq!(extract_attribute(ct, "boundary"), Some("XY;Z".to_string()));
        assert_eq!(extract_attribute(ct, "charset"), Some("utf-8".to_string()));
    }

    #[test]
    fn prefix_match_is_case_insensitive() {
        assert!(starts_with_ci(
            "MULTIPART/form-data; boundary=X",
            "multipart/form-data"
        ));
        assert!(!starts_with_ci("text/plain", "multipart/form-data"));
    }

    #[test]
    fn multimap_preserves_insertion_order_and_multi_values() {
        let mut m: MultiMap<i32> = MultiMap::new();
        m.push("b", 1);
        m.push("a", 2);
        m.push("b", 3);
        let names: Vec<_> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert_eq!(m.get("b"), Some(&[1, 3][..]));
    }
}
