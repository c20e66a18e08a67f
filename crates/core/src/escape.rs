//! Case-encoding of module paths and versions.
//!
//! Module paths may contain upper-case letters, but they are served from
//! case-insensitive file systems and URLs. Every upper-case letter is
//! therefore written as `!` followed by its lower-case form, so
//! `github.com/Azure/go-autorest` becomes `github.com/!azure/go-autorest`.

use crate::error::{Error, Result};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};

/// Characters that must be percent-encoded inside a single URL path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Encode a module path for use in a proxy URL or file name.
pub fn escape_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(Error::InvalidModulePath("empty module path".to_string()));
    }
    escape_string(path)
}

/// Decode a module path received from a proxy URL.
pub fn unescape_path(escaped: &str) -> Result<String> {
    if escaped.is_empty() {
        return Err(Error::InvalidModulePath("empty module path".to_string()));
    }
    unescape_string(escaped)
}

/// Decode a version received from a proxy URL.
pub fn unescape_version(escaped: &str) -> Result<String> {
    unescape_string(escaped)
}

/// Case-encode `path` and percent-encode every `/`-separated segment.
///
/// The result can be appended to a proxy base URL.
pub fn escaped_url_path(path: &str) -> Result<String> {
    let escaped = escape_path(path)?;
    let segments: Vec<String> = escaped
        .split('/')
        .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
        .collect();
    Ok(segments.join("/"))
}

/// Returns true when `path` equals `ancestor` or continues it with a `/`.
///
/// `example.com/a/b` descends from `example.com/a` but `example.com/ab` does not.
pub fn path_is_lexical_descendant(path: &str, ancestor: &str) -> bool {
    match path.strip_prefix(ancestor) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

fn escape_string(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '!' || !c.is_ascii() {
            return Err(Error::InvalidEscape {
                input: s.to_string(),
                reason: format!("character {c:?} cannot be escaped"),
            });
        }
        if c.is_ascii_uppercase() {
            out.push('!');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

fn unescape_string(escaped: &str) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidEscape {
        input: escaped.to_string(),
        reason: reason.to_string(),
    };

    let mut out = String::with_capacity(escaped.len());
    let mut bang = false;
    for c in escaped.chars() {
        if !c.is_ascii() {
            return Err(invalid("non-ASCII character"));
        }
        if bang {
            bang = false;
            if !c.is_ascii_lowercase() {
                return Err(invalid("'!' must be followed by a lower-case letter"));
            }
            out.push(c.to_ascii_uppercase());
            continue;
        }
        if c == '!' {
            bang = true;
            continue;
        }
        if c.is_ascii_uppercase() {
            return Err(invalid("upper-case letters must be escaped"));
        }
        out.push(c);
    }
    if bang {
        return Err(invalid("trailing '!'"));
    }
    Ok(out)
}
