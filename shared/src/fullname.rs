//! Conversion between `(name, type, domain)` triples and escaped DNS full names.
//!
//! The instance label is escaped the same way DNS-SD daemons do it: `.` and
//! `\` get a backslash prefix, bytes up to and including space (and DEL) are
//! written as `\ddd` with the decimal byte value. Everything else, including
//! non-ASCII UTF-8, is copied as is. Type and domain are already DNS names and
//! are appended in presentation form.

use thiserror::Error;
use crate::protocol::DEFAULT_DOMAIN;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FullNameError {
    #[error("dangling or malformed escape at byte {0}")]
    BadEscape(usize),

    #[error("instance label is not valid UTF-8")]
    InvalidUtf8,

    #[error("full name '{0}' has no service type")]
    MissingType(String),
}

/// Escapes a single instance label.
pub fn escape_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for c in label.chars() {
        match c {
            '.' | '\\' => {
                out.push('\\');
                out.push(c);
            }
            c if (c as u32) <= 0x20 || c == '\u{7f}' => {
                out.push_str(&format!("\\{:03}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Builds the escaped full name of a service instance.
pub fn escape(name: &str, service_type: &str, domain: &str) -> String {
    format!(
        "{}.{}.{}",
        escape_label(name),
        normalize_type(service_type),
        normalize_domain(domain)
    )
}

/// Splits an escaped full name back into its unescaped instance name, service
/// type (two labels) and domain.
pub fn unescape(full_name: &str) -> Result<(String, String, String), FullNameError> {
    let (raw_name, rest) = split_label(full_name, 0)?;
    let name = unescape_label(raw_name, 0)?;

    let offset = raw_name.len() + 1;
    let (service, rest) = split_label(rest, offset)?;
    let (proto, domain) = split_label(rest, offset + service.len() + 1)?;
    if service.is_empty() || proto.is_empty() {
        return Err(FullNameError::MissingType(full_name.to_string()));
    }

    Ok((
        name,
        format!("{}.{}", service, proto),
        normalize_domain(domain),
    ))
}

/// Service types are stored without a trailing dot.
pub fn normalize_type(service_type: &str) -> String {
    service_type.trim_end_matches('.').to_string()
}

/// Domains are stored with exactly one trailing dot.
pub fn normalize_domain(domain: &str) -> String {
    let trimmed = domain.trim_end_matches('.');
    if trimmed.is_empty() {
        DEFAULT_DOMAIN.to_string()
    } else {
        format!("{}.", trimmed)
    }
}

/// Returns the first label (still escaped) and the remainder after its
/// terminating unescaped dot.
fn split_label(s: &str, offset: usize) -> Result<(&str, &str), FullNameError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                if i + 1 >= bytes.len() {
                    return Err(FullNameError::BadEscape(offset + i));
                }
                i += 2;
            }
            b'.' => return Ok((&s[..i], &s[i + 1..])),
            _ => i += 1,
        }
    }
    Ok((s, ""))
}

fn unescape_label(label: &str, offset: usize) -> Result<String, FullNameError> {
    let bytes = label.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        let digits = bytes.get(i + 1..i + 4);
        match digits {
            Some(d) if d.iter().all(u8::is_ascii_digit) => {
                let value = d.iter().fold(0u32, |acc, b| acc * 10 + u32::from(b - b'0'));
                let byte = u8::try_from(value).map_err(|_| FullNameError::BadEscape(offset + i))?;
                out.push(byte);
                i += 4;
            }
            _ => match bytes.get(i + 1) {
                // A multi-byte character after the backslash is copied whole
                // by the loop on the next iterations.
                Some(&b) if !b.is_ascii_digit() => {
                    out.push(b);
                    i += 2;
                }
                _ => return Err(FullNameError::BadEscape(offset + i)),
            },
        }
    }
    String::from_utf8(out).map_err(|_| FullNameError::InvalidUtf8)
}
