use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::error::AddressError;

/// Longest local part permitted by RFC 5321 §4.5.3.1.1
const MAX_LOCAL_PART: usize = 64;

/// Longest domain permitted by RFC 5321 §4.5.3.1.2
const MAX_DOMAIN: usize = 255;

/// A syntactically valid `local@domain` mailbox.
///
/// Only the dot-atom form is accepted: quoted local parts and address
/// literals are rejected since none of the upstream providers accept them.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    local_part: String,
    domain: String,
}

impl Address {
    /// Parse and validate an address.
    ///
    /// # Errors
    /// Returns an [`AddressError`] describing the first syntax violation found.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        let input = input
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .unwrap_or(input);

        let (local_part, domain) = input
            .rsplit_once('@')
            .ok_or_else(|| AddressError::MissingAt(input.to_string()))?;

        validate_local_part(local_part)?;
        validate_domain(domain)?;

        Ok(Self {
            local_part: local_part.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }

    #[must_use]
    pub fn local_part(&self) -> &str {
        &self.local_part
    }

    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

const fn is_atext(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#'
                | '$'
                | '%'
                | '&'
                | '\''
                | '*'
                | '+'
                | '-'
                | '/'
                | '='
                | '?'
                | '^'
                | '_'
                | '`'
                | '{'
                | '|'
                | '}'
                | '~'
        )
}

fn validate_local_part(local: &str) -> Result<(), AddressError> {
    if local.is_empty() || local.len() > MAX_LOCAL_PART {
        return Err(AddressError::InvalidLocalPart(local.to_string()));
    }

    // dot-atom: no leading, trailing or doubled dots
    if local.split('.').any(|atom| atom.is_empty() || !atom.chars().all(is_atext)) {
        return Err(AddressError::InvalidLocalPart(local.to_string()));
    }

    Ok(())
}

fn validate_domain(domain: &str) -> Result<(), AddressError> {
    if domain.is_empty() || domain.len() > MAX_DOMAIN || !domain.contains('.') {
        return Err(AddressError::InvalidDomain(domain.to_string()));
    }

    let valid_label = |label: &str| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    };

    if domain.split('.').all(valid_label) {
        Ok(())
    } else {
        Err(AddressError::InvalidDomain(domain.to_string()))
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}
