//! SMTP command parsing.

use core::fmt::{self, Display, Formatter};

use postern_common::address::Address;

#[derive(Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    StartTls,
    Auth {
        mechanism: String,
        /// Optional initial response, still base64.
        initial: Option<String>,
    },
    /// `None` is the null reverse-path `<>`.
    MailFrom(Option<Address>),
    RcptTo(Address),
    Data,
    Rset,
    Noop,
    Quit,
    Help,
    /// Recognized shape, unusable arguments; replied with 501.
    Invalid(String),
    /// Verb we do not implement; replied with 502.
    Unknown(String),
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(domain) => write!(f, "HELO {domain}"),
            Self::Ehlo(domain) => write!(f, "EHLO {domain}"),
            Self::StartTls => f.write_str("STARTTLS"),
            Self::Auth { mechanism, .. } => write!(f, "AUTH {mechanism}"),
            Self::MailFrom(None) => f.write_str("MAIL FROM:<>"),
            Self::MailFrom(Some(addr)) => write!(f, "MAIL FROM:<{addr}>"),
            Self::RcptTo(addr) => write!(f, "RCPT TO:<{addr}>"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::Help => f.write_str("HELP"),
            Self::Invalid(reason) => write!(f, "<invalid: {reason}>"),
            Self::Unknown(verb) => write!(f, "<unknown: {verb}>"),
        }
    }
}

fn strip_mail_params(rest: &str) -> &str {
    // ESMTP parameters (SIZE=, BODY=, ...) may trail the path; the path is
    // the first token.
    rest.split_whitespace().next().unwrap_or(rest)
}

impl TryFrom<&str> for Command {
    type Error = Self;

    fn try_from(line: &str) -> Result<Self, Self::Error> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Err(Self::Invalid("empty command".to_string()));
        }

        if trimmed.len() >= 10 && trimmed[..10].eq_ignore_ascii_case("MAIL FROM:") {
            let path = strip_mail_params(trimmed[10..].trim());
            if path == "<>" {
                return Ok(Self::MailFrom(None));
            }
            return match Address::parse(path) {
                Ok(addr) => Ok(Self::MailFrom(Some(addr))),
                Err(e) => Err(Self::Invalid(e.to_string())),
            };
        }

        if trimmed.len() >= 8 && trimmed[..8].eq_ignore_ascii_case("RCPT TO:") {
            let path = strip_mail_params(trimmed[8..].trim());
            return match Address::parse(path) {
                Ok(addr) => Ok(Self::RcptTo(addr)),
                Err(e) => Err(Self::Invalid(e.to_string())),
            };
        }

        let (verb, args) = match trimmed.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (trimmed, ""),
        };

        if verb.eq_ignore_ascii_case("EHLO") {
            return if args.is_empty() {
                Err(Self::Invalid("EHLO requires a domain".to_string()))
            } else {
                Ok(Self::Ehlo(args.to_string()))
            };
        }
        if verb.eq_ignore_ascii_case("HELO") {
            return if args.is_empty() {
                Err(Self::Invalid("HELO requires a domain".to_string()))
            } else {
                Ok(Self::Helo(args.to_string()))
            };
        }
        if verb.eq_ignore_ascii_case("AUTH") {
            let mut parts = args.split_whitespace();
            let Some(mechanism) = parts.next() else {
                return Err(Self::Invalid("AUTH requires a mechanism".to_string()));
            };
            return Ok(Self::Auth {
                mechanism: mechanism.to_ascii_uppercase(),
                initial: parts.next().map(str::to_string),
            });
        }
        if verb.eq_ignore_ascii_case("STARTTLS") {
            return Ok(Self::StartTls);
        }
        if verb.eq_ignore_ascii_case("DATA") {
            return Ok(Self::Data);
        }
        if verb.eq_ignore_ascii_case("RSET") {
            return Ok(Self::Rset);
        }
        if verb.eq_ignore_ascii_case("NOOP") {
            return Ok(Self::Noop);
        }
        if verb.eq_ignore_ascii_case("QUIT") {
            return Ok(Self::Quit);
        }
        if verb.eq_ignore_ascii_case("HELP") {
            return Ok(Self::Help);
        }

        Err(Self::Unknown(verb.to_string()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn parse(line: &str) -> Command {
        Command::try_from(line).unwrap_or_else(|e| e)
    }

    #[test]
    fn case_insensitive_verbs() {
        assert_eq!(parse("quit"), Command::Quit);
        assert_eq!(parse("QuIt"), Command::Quit);
        assert_eq!(parse("noop"), Command::Noop);
        assert_eq!(parse("rset"), Command::Rset);
        assert_eq!(parse("data"), Command::Data);
        assert_eq!(parse("starttls"), Command::StartTls);
        assert_eq!(parse("help"), Command::Help);
    }

    #[test]
    fn helo_and_ehlo_carry_domains() {
        assert_eq!(
            parse("EHLO client.example.org"),
            Command::Ehlo("client.example.org".to_string())
        );
        assert_eq!(parse("helo x"), Command::Helo("x".to_string()));
        assert!(matches!(parse("EHLO"), Command::Invalid(_)));
    }

    #[test]
    fn mail_from_variants() {
        assert_eq!(
            parse("MAIL FROM:<alice@example.org>"),
            Command::MailFrom(Some(Address::parse("alice@example.org").unwrap()))
        );
        assert_eq!(parse("mail from: <>"), Command::MailFrom(None));
        assert_eq!(
            parse("MAIL FROM:<a@b.example> SIZE=1000"),
            Command::MailFrom(Some(Address::parse("a@b.example").unwrap()))
        );
        assert!(matches!(parse("MAIL FROM:<not-valid>"), Command::Invalid(_)));
    }

    #[test]
    fn rcpt_to_requires_address() {
        assert_eq!(
            parse("RCPT TO:<bob@example.net>"),
            Command::RcptTo(Address::parse("bob@example.net").unwrap())
        );
        assert!(matches!(parse("RCPT TO:<>"), Command::Invalid(_)));
    }

    #[test]
    fn auth_with_and_without_initial_response() {
        assert_eq!(
            parse("AUTH PLAIN AGFsaWNlAHMzY3JldA=="),
            Command::Auth {
                mechanism: "PLAIN".to_string(),
                initial: Some("AGFsaWNlAHMzY3JldA==".to_string()),
            }
        );
        assert_eq!(
            parse("auth login"),
            Command::Auth {
                mechanism: "LOGIN".to_string(),
                initial: None,
            }
        );
        assert!(matches!(parse("AUTH"), Command::Invalid(_)));
    }

    #[test]
    fn unknown_verbs_are_502_material() {
        assert!(matches!(parse("VRFY alice"), Command::Unknown(_)));
        assert!(matches!(parse("EXPN list"), Command::Unknown(_)));
    }
}
