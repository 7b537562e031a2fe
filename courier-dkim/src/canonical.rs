//! `relaxed` canonicalization, RFC 6376 §3.4.2 and §3.4.4.

use crate::SigningError;

/// A header as it appears in the message. `value` keeps any folding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

const fn is_wsp(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Split a rendered message at the first empty line.
///
/// The header block keeps the CRLF of its final line.
pub fn split_message(raw: &str) -> Result<(&str, &str), SigningError> {
    raw.find("\r\n\r\n")
        .map(|idx| (&raw[..idx + 2], &raw[idx + 4..]))
        .ok_or(SigningError::MissingSeparator)
}

/// Parse a CRLF-terminated header block, joining continuation lines.
pub fn parse_headers(block: &str) -> Result<Vec<RawHeader>, SigningError> {
    let mut headers: Vec<RawHeader> = Vec::new();

    for line in block.strip_suffix("\r\n").unwrap_or(block).split("\r\n") {
        if line.contains(['\r', '\n']) {
            return Err(SigningError::MalformedHeader(format!(
                "bare line break in {line:?}"
            )));
        }

        if line.starts_with(is_wsp) {
            let Some(current) = headers.last_mut() else {
                return Err(SigningError::MalformedHeader(
                    "continuation line before the first header".to_string(),
                ));
            };
            current.value.push_str("\r\n");
            current.value.push_str(line);
            continue;
        }

        let Some((name, value)) = line.split_once(':') else {
            return Err(SigningError::MalformedHeader(format!(
                "missing ':' in {line:?}"
            )));
        };

        let name = name.trim_end_matches(is_wsp);
        if name.is_empty() || name.contains(is_wsp) {
            return Err(SigningError::MalformedHeader(format!(
                "invalid field name {name:?}"
            )));
        }

        headers.push(RawHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
    }

    Ok(headers)
}

/// Replace every run of WSP with a single space.
fn collapse_wsp(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut in_wsp = false;

    for c in input.chars() {
        if is_wsp(c) {
            if !in_wsp {
                out.push(' ');
            }
            in_wsp = true;
        } else {
            out.push(c);
            in_wsp = false;
        }
    }

    out
}

/// `relaxed` header canonicalization, including the trailing CRLF.
#[must_use]
pub fn relaxed_header(name: &str, value: &str) -> String {
    let unfolded = value.replace("\r\n", "");
    let value = collapse_wsp(&unfolded);
    format!("{}:{}\r\n", name.trim().to_ascii_lowercase(), value.trim_matches(' '))
}

/// `relaxed` body canonicalization.
///
/// Trailing empty lines are dropped and a non-empty body always ends in CRLF.
#[must_use]
pub fn relaxed_body(body: &str) -> String {
    let mut lines: Vec<String> = body
        .split("\r\n")
        .map(|line| collapse_wsp(line).trim_end_matches(' ').to_string())
        .collect();

    while lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }

    if lines.is_empty() {
        return String::new();
    }

    let mut out = lines.join("\r\n");
    out.push_str("\r\n");
    out
}
