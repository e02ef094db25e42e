//! `Cookie:` header parser.
//!
//! Per `SPEC_FULL.md` §9 (resolving the source's divergent `Cookie`
//! definitions): a single per-cookie struct carries its `$Version`/
//! `$Domain`/`$Path` attributes directly; the map-backed rewrite in the
//! original is out of scope.

use crate::error::Result;

/// One parsed cookie, with whatever `$Version`/`$Domain`/`$Path`
/// attributes applied to it (either inherited from the header-wide
/// defaults, or set explicitly after it in the header).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub version: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
}

/// Attributes that apply to cookies listed after them, until overridden.
#[derive(Debug, Clone, Default)]
struct Attrs {
    version: Option<String>,
    domain: Option<String>,
    path: Option<String>,
}

impl Attrs {
    fn apply_to(&self, c: &mut Cookie) {
        if self.version.is_some() {
            c.version = self.version.clone();
        }
        if self.domain.is_some() {
            c.domain = self.domain.clone();
        }
        if self.path.is_some() {
            c.path = self.path.clone();
        }
    }

    fn set(&mut self, attr_name: &str, value: String) {
        match attr_name.to_ascii_lowercase().as_str() {
            "$version" => self.version = Some(value),
            "$domain" => self.domain = Some(value),
            "$path" => self.path = Some(value),
            _ => {}
        }
    }
}

/// Parsed `Cookie:` header: the ordered, multi-valued set of cookies plus
/// the global `$Version`/`$Domain`/`$Path` carrier for attributes seen
/// before the first named cookie.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    global: Attrs,
    pub cookies: crate::http::MultiMap<Cookie>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&[Cookie]> {
        self.cookies.get(name)
    }

    /// Parse a full `Cookie:` header value, folding in whatever was
    /// already accumulated (a header can legally arrive in one shot; this
    /// also supports being called once per `PARAMS` pair if ever needed).
    pub fn parse(&mut self, header: &str) -> Result<()> {
        // Parse into a flat, emission-ordered list first: `$`-attributes
        // mutate whichever element is last in *this* list, which is far
        // simpler than mutating through the name-keyed MultiMap mid-parse.
        let mut emitted: Vec<Cookie> = Vec::new();
        for token in split_respecting_quotes(header) {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = split_name_value(token);
            let value = unquote(value);
            if let Some(attr) = name.strip_prefix('$') {
                let attr_name = format!("${attr}");
                match emitted.last_mut() {
                    Some(cookie) => {
                        let mut attrs = Attrs::default();
                        attrs.set(&attr_name, value);
                        attrs.apply_to(cookie);
                    }
                    None => self.global.set(&attr_name, value),
                }
            } else {
                let mut cookie = Cookie {
                    name: name.to_string(),
                    value,
                    ..Default::default()
                };
                self.global.apply_to(&mut cookie);
                emitted.push(cookie);
            }
        }
        for cookie in emitted {
            self.cookies.push(cookie.name.clone(), cookie);
        }
        Ok(())
    }
}

fn split_name_value(token: &str) -> (&str, &str) {
    match token.find('=') {
        Some(i) => (token[..i].trim(), token[i + 1..].trim()),
        None => (token.trim(), ""),
    }
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"")
    } else {
        s.to_string()
    }
}

/// Split on `,` or `;` outside of a balanced double-quoted run.
fn split_respecting_quotes(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let bytes = s.as_bytes();
    let mut start = 0;
    let mut in_quotes = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => in_quotes = !in_quotes,
            b',' | b';' if !in_quotes => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    out.push(&s[start..]);
    out
}
