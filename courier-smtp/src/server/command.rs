use core::fmt::{self, Display, Formatter};

/// ESMTP parameters of a MAIL FROM command (RFC 5321 Section 3.3).
///
/// Only SIZE (RFC 1870) changes what the server does; the rest are kept so
/// that duplicates can be refused.
#[derive(PartialEq, Eq, Debug, Clone, Default)]
pub struct MailParameters {
    params: Vec<(String, Option<String>)>,
}

impl MailParameters {
    /// Parse `KEY=VALUE` and `FLAG` tokens, case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter repeats, or SIZE is not a positive
    /// number.
    pub fn from_params_str(params_str: &str) -> Result<Self, String> {
        let mut params = Self::default();

        for token in params_str.split_whitespace() {
            let (key, value) = token
                .split_once('=')
                .map_or((token, None), |(key, value)| (key, Some(value)));
            let key = key.to_ascii_uppercase();

            if params.has(&key) {
                return Err(format!("Duplicate parameter '{key}' not allowed"));
            }

            if key == "SIZE" {
                match value.map(str::parse::<usize>) {
                    Some(Ok(0)) => return Err(String::from("SIZE=0 is not allowed")),
                    Some(Ok(_)) => {}
                    _ => return Err(format!("Invalid SIZE value: {}", value.unwrap_or(""))),
                }
            }

            params.params.push((key, value.map(ToString::to_string)));
        }

        Ok(params)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .and_then(|(_, value)| value.as_deref())
    }

    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.params.iter().any(|(name, _)| name.eq_ignore_ascii_case(key))
    }

    /// Declared message size in bytes
    #[must_use]
    pub fn size(&self) -> Option<usize> {
        self.get("SIZE").and_then(|size| size.parse().ok())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl Display for MailParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for (index, (key, value)) in self.params.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            match value {
                None => f.write_str(key)?,
                Some(value) => write!(f, "{key}={value}")?,
            }
        }
        Ok(())
    }
}

#[derive(PartialEq, Eq, Debug, Clone)]
pub enum HeloVariant {
    Ehlo(String),
    Helo(String),
}

/// A command line as received from a submitting client
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Command {
    Helo(HeloVariant),
    /// An empty path is the null reverse-path of RFC 5321
    MailFrom(String, MailParameters),
    RcptTo(String),
    /// Mechanism and the optional initial response
    Auth(String, Option<String>),
    Data,
    Rset,
    Noop,
    Vrfy,
    Quit,
    StartTls,
    Invalid(String),
}

/// The mailbox between angle brackets, or the bare argument
fn path(argument: &str) -> Result<String, String> {
    let argument = argument.trim();
    let address = match argument.strip_prefix('<') {
        Some(rest) => rest
            .strip_suffix('>')
            .ok_or_else(|| format!("Unterminated path: {argument}"))?,
        None => argument,
    };

    if address.contains(['<', '>', ' ']) {
        return Err(format!("Invalid path: {argument}"));
    }

    Ok(address.to_string())
}

/// The rest of `line` after `prefix`, ignoring case.
fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    line.get(..prefix.len())
        .filter(|head| head.eq_ignore_ascii_case(prefix))
        .map(|_| &line[prefix.len()..])
}

/// Split a verb that may be followed by arguments, ignoring case.
fn strip_verb<'a>(line: &'a str, verb: &str) -> Option<&'a str> {
    let rest = strip_prefix_ignore_case(line, verb)?;
    if rest.is_empty() || rest.starts_with(' ') {
        Some(rest.trim())
    } else {
        None
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(HeloVariant::Ehlo(id)) => write!(fmt, "EHLO {id}"),
            Self::Helo(HeloVariant::Helo(id)) => write!(fmt, "HELO {id}"),
            Self::MailFrom(from, params) if params.is_empty() => write!(fmt, "MAIL FROM:<{from}>"),
            Self::MailFrom(from, params) => write!(fmt, "MAIL FROM:<{from}> {params}"),
            Self::RcptTo(to) => write!(fmt, "RCPT TO:<{to}>"),
            // never echo credentials into the logs
            Self::Auth(mechanism, _) => write!(fmt, "AUTH {mechanism}"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Vrfy => fmt.write_str("VRFY"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Invalid(s) => fmt.write_str(s),
        }
    }
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(command: &str) -> Result<Self, Self::Error> {
        let trimmed = command.trim();

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "MAIL FROM:") {
            let rest = rest.trim();
            let (addr, params) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));

            let params = MailParameters::from_params_str(params).map_err(Self::Invalid)?;
            if addr.is_empty() {
                return Err(Self::Invalid(format!("Missing reverse-path in {trimmed}")));
            }

            return path(addr)
                .map(|from| Self::MailFrom(from, params))
                .map_err(Self::Invalid);
        }

        if let Some(rest) = strip_prefix_ignore_case(trimmed, "RCPT TO:") {
            let to = path(rest).map_err(Self::Invalid)?;
            if to.is_empty() {
                return Err(Self::Invalid(format!("Missing forward-path in {trimmed}")));
            }
            return Ok(Self::RcptTo(to));
        }

        if let Some(host) = strip_verb(trimmed, "EHLO") {
            return if host.is_empty() {
                Err(Self::Invalid(format!("Expected hostname in {trimmed}")))
            } else {
                Ok(Self::Helo(HeloVariant::Ehlo(host.to_string())))
            };
        }

        if let Some(host) = strip_verb(trimmed, "HELO") {
            return if host.is_empty() {
                Err(Self::Invalid(format!("Expected hostname in {trimmed}")))
            } else {
                Ok(Self::Helo(HeloVariant::Helo(host.to_string())))
            };
        }

        if let Some(arguments) = strip_verb(trimmed, "AUTH") {
            let mut arguments = arguments.split_whitespace();
            return arguments.next().map_or_else(
                || Err(Self::Invalid(String::from("AUTH requires a mechanism"))),
                |mechanism| {
                    Ok(Self::Auth(
                        mechanism.to_ascii_uppercase(),
                        arguments.next().map(ToString::to_string),
                    ))
                },
            );
        }

        if strip_verb(trimmed, "VRFY").is_some() {
            return Ok(Self::Vrfy);
        }

        if strip_verb(trimmed, "NOOP").is_some() {
            return Ok(Self::Noop);
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "QUIT" => Ok(Self::Quit),
            "STARTTLS" => Ok(Self::StartTls),
            _ => Err(Self::Invalid(command.trim_end().to_owned())),
        }
    }
}

impl TryFrom<&[u8]> for Command {
    type Error = Self;

    fn try_from(command: &[u8]) -> Result<Self, Self::Error> {
        std::str::from_utf8(command).map_or_else(
            |_| Err(Self::Invalid("Unable to interpret command".to_string())),
            Self::try_from,
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn string_casing(string: &str) -> impl Iterator<Item = String> {
        let len = string.len();
        let num_cases = 1_usize << len;

        let (upper, lower): (Vec<char>, Vec<char>) = string
            .chars()
            .map(|c| (c.to_ascii_uppercase(), c.to_ascii_lowercase()))
            .unzip();

        (0..num_cases).map(move |i| {
            (0..len)
                .map(|idx| if i & (1 << idx) == 0 { lower[idx] } else { upper[idx] })
                .collect()
        })
    }

    #[test]
    fn test_mail_from_command() {
        for verb in string_casing("mail from:") {
            assert_eq!(
                Command::try_from(format!("{verb}<app@example.com>").as_str()),
                Ok(Command::MailFrom(
                    "app@example.com".to_string(),
                    MailParameters::default()
                ))
            );
        }

        assert_eq!(
            Command::try_from("MAIL FROM: app@example.com"),
            Ok(Command::MailFrom(
                "app@example.com".to_string(),
                MailParameters::default()
            ))
        );
        assert_eq!(
            Command::try_from("MAIL FROM:<>"),
            Ok(Command::MailFrom(String::new(), MailParameters::default()))
        );
        assert!(Command::try_from("MAIL FROM:").is_err());
        assert!(Command::try_from("MAIL FROM:<app@example.com").is_err());
    }

    #[test]
    fn test_mail_from_size_edge_cases() {
        let Ok(Command::MailFrom(_, params)) =
            Command::try_from("MAIL FROM:<app@example.com> SIZE=12345 BODY=8BITMIME")
        else {
            panic!("expected MAIL FROM");
        };
        assert_eq!(params.size(), Some(12345));
        assert_eq!(params.get("body"), Some("8BITMIME"));
        assert_eq!(params.to_string(), "SIZE=12345 BODY=8BITMIME");

        assert_eq!(
            Command::try_from("MAIL FROM:<a@example.com> SIZE=0"),
            Err(Command::Invalid("SIZE=0 is not allowed".to_string()))
        );
        assert_eq!(
            Command::try_from("MAIL FROM:<a@example.com> SIZE=big"),
            Err(Command::Invalid("Invalid SIZE value: big".to_string()))
        );
        assert_eq!(
            Command::try_from("MAIL FROM:<a@example.com> SIZE=1 size=2"),
            Err(Command::Invalid("Duplicate parameter 'SIZE' not allowed".to_string()))
        );
    }

    #[test]
    fn test_rcpt_to_command() {
        for verb in string_casing("rcpt to:") {
            assert_eq!(
                Command::try_from(format!("{verb}<user@example.org>").as_str()),
                Ok(Command::RcptTo("user@example.org".to_string()))
            );
        }

        assert!(Command::try_from("RCPT TO:<>").is_err());
        assert!(Command::try_from("RCPT TO:<a@example.org> <b@example.org>").is_err());
    }

    #[test]
    fn test_helo_ehlo_command() {
        assert_eq!(
            Command::try_from("EHLO client.example.com\r\n"),
            Ok(Command::Helo(HeloVariant::Ehlo("client.example.com".to_string())))
        );
        assert_eq!(
            Command::try_from("helo client"),
            Ok(Command::Helo(HeloVariant::Helo("client".to_string())))
        );
        assert!(Command::try_from("EHLO").is_err());
        assert!(Command::try_from("EHLOclient").is_err());
    }

    #[test]
    fn test_auth_command() {
        assert_eq!(
            Command::try_from("auth plain AHVzZXIAc2VjcmV0"),
            Ok(Command::Auth(
                "PLAIN".to_string(),
                Some("AHVzZXIAc2VjcmV0".to_string())
            ))
        );
        assert_eq!(
            Command::try_from("AUTH LOGIN"),
            Ok(Command::Auth("LOGIN".to_string(), None))
        );
        assert!(Command::try_from("AUTH").is_err());

        // the initial response stays out of the rendered form
        assert_eq!(
            Command::try_from("AUTH PLAIN AHVzZXIAc2VjcmV0").unwrap().to_string(),
            "AUTH PLAIN"
        );
    }

    #[test]
    fn test_other_commands() {
        for (input, expected) in [
            ("DATA", Command::Data),
            ("rset", Command::Rset),
            ("NOOP", Command::Noop),
            ("noop anything", Command::Noop),
            ("VRFY postmaster", Command::Vrfy),
            ("QUIT", Command::Quit),
            ("StartTLS", Command::StartTls),
        ] {
            assert_eq!(Command::try_from(input), Ok(expected), "{input}");
        }

        assert_eq!(
            Command::try_from("EXPN staff\r\n"),
            Err(Command::Invalid("EXPN staff".to_string()))
        );
        assert!(Command::try_from([0xff, 0xfe].as_slice()).is_err());
    }
}
