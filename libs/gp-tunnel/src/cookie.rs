//! The session cookie and query-string plumbing around it.
//!
//! The cookie is an opaque `&`-separated sequence of `key[=value]` fields
//! acquired during authentication. The tunnel core never interprets it as a
//! whole; it only recognises two subsets by field name: `user`/`authcookie`
//! (replayed on the tunnel GET) and `preferred-ip` (suppressed on
//! reconnect). Everything else passes through verbatim.

use std::fmt;

/// Opaque authentication cookie, e.g. `user=alice&authcookie=deadbeef&portal=gw`.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCookie(String);

impl SessionCookie {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The authcookie field is a bearer credential.
        f.write_str("SessionCookie(..)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    /// Emit only fields whose key is in the name list.
    Keep,
    /// Emit only fields whose key is NOT in the name list.
    Drop,
}

/// Appends the fields of `query` selected by `names`/`filter` to `buf`.
///
/// A field matches a name if the name equals the first
/// `max(name len, key len)` bytes of the query remainder starting at the
/// field, with the name logically zero-padded. In practice this is key
/// equality; the longest-of-lengths window keeps prefix keys (`user` vs
/// `username`) apart.
///
/// A `&` separator is emitted only when `buf` does not already end in `?` or
/// `&`, so the same routine serves both query strings and form bodies.
pub fn filter_opts(buf: &mut String, query: &str, names: &[&str], filter: Filter) {
    let mut start = 0;

    while start < query.len() {
        let end = query[start..]
            .find('&')
            .map(|i| start + i)
            .unwrap_or(query.len());
        let field = &query[start..end];

        if !field.is_empty() {
            let key_len = field.find('=').unwrap_or(field.len());
            // The comparison window deliberately extends to the end of the
            // query, not the end of the field.
            let window = &query.as_bytes()[start..];

            let matched = names
                .iter()
                .any(|name| name_matches(window, key_len, name.as_bytes()));

            if matched == (filter == Filter::Keep) {
                push_separator(buf);
                buf.push_str(field);
            }
        }

        start = end + 1;
    }
}

fn name_matches(window: &[u8], key_len: usize, name: &[u8]) -> bool {
    let n = name.len().max(key_len);

    (0..n).all(|i| {
        let a = name.get(i).copied().unwrap_or(0);
        let b = window.get(i).copied().unwrap_or(0);

        a == b
    })
}

/// Appends `name=<value>` with the value percent-encoded, preceded by a `&`
/// separator where needed.
pub fn append_opt(buf: &mut String, name: &str, value: &str) {
    push_separator(buf);
    buf.push_str(name);
    buf.push('=');
    append_urlencoded(buf, value);
}

fn push_separator(buf: &mut String) {
    if !buf.is_empty() && !buf.ends_with(['?', '&']) {
        buf.push('&');
    }
}

/// Percent-encodes `value` the way the gateway expects form fields: ASCII
/// alphanumerics and `- _ . , :` pass through, everything else becomes
/// `%xx`. The pass-through set keeps the fixed algorithm lists
/// (`sha1,md5`, `aes-128-cbc,aes-256-cbc`) verbatim on the wire.
fn append_urlencoded(buf: &mut String, value: &str) {
    for byte in value.bytes() {
        match byte {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' | b'.' | b',' | b':' => {
                buf.push(char::from(byte));
            }
            _ => {
                buf.push('%');
                buf.push_str(&format!("{byte:02x}"));
            }
        }
    }
}
