//! The RFC 5321 command sequencing machine.
//!
//! [`decide`] is a pure function from (state, command, gates) to the action
//! the session must take, so every legality rule is testable without a
//! socket. The session owns the side effects.

use postern_common::address::Address;
use postern_common::status::Status;

use crate::command::Command;

/// Protocol position of a session. "Authenticated" in the protocol sense is
/// [`State::Greeted`] plus the authenticated gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Connected,
    Greeted,
    MailFrom,
    RcptTo,
    Data,
}

/// Session facts the legality rules depend on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gates {
    pub tls_active: bool,
    pub authenticated: bool,
    /// `require_starttls`: AUTH needs TLS first.
    pub require_starttls: bool,
    /// `tls_required`: MAIL/RCPT/DATA need TLS.
    pub tls_required: bool,
    pub tls_available: bool,
}

/// What the session should do with a command.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    Greet { domain: String, extended: bool },
    UpgradeTls,
    Authenticate { mechanism: String, initial: Option<String> },
    AcceptMail(Option<Address>),
    AcceptRcpt(Address),
    BeginData,
    Reset,
    Noop,
    Help,
    Quit,
    /// Send this reply; state unchanged.
    Reply(Status, &'static str),
}

const BAD_SEQUENCE: (Status, &str) = (Status::InvalidCommandSequence, "Bad sequence of commands");

#[must_use]
pub fn decide(state: State, command: Command, gates: &Gates) -> Action {
    match command {
        Command::Helo(domain) => Action::Greet {
            domain,
            extended: false,
        },
        Command::Ehlo(domain) => Action::Greet {
            domain,
            extended: true,
        },

        Command::StartTls => {
            if state != State::Greeted {
                return Action::Reply(BAD_SEQUENCE.0, BAD_SEQUENCE.1);
            }
            if gates.tls_active {
                return Action::Reply(Status::TlsNotAvailable, "TLS already active");
            }
            if !gates.tls_available {
                return Action::Reply(Status::TlsNotAvailable, "TLS not available");
            }
            Action::UpgradeTls
        }

        Command::Auth { mechanism, initial } => {
            if state != State::Greeted {
                return Action::Reply(BAD_SEQUENCE.0, BAD_SEQUENCE.1);
            }
            if gates.authenticated {
                return Action::Reply(Status::InvalidCommandSequence, "Already authenticated");
            }
            if gates.tls_required && !gates.tls_active {
                return Action::Reply(Status::AuthRequired, "Must issue STARTTLS first");
            }
            if gates.require_starttls && !gates.tls_active {
                return Action::Reply(Status::AuthRequired, "Must issue STARTTLS first");
            }
            Action::Authenticate { mechanism, initial }
        }

        Command::MailFrom(sender) => {
            if state != State::Greeted {
                return Action::Reply(BAD_SEQUENCE.0, BAD_SEQUENCE.1);
            }
            if gates.tls_required && !gates.tls_active {
                return Action::Reply(Status::AuthRequired, "Must issue STARTTLS first");
            }
            if !gates.authenticated {
                return Action::Reply(Status::AuthRequired, "Authentication required");
            }
            Action::AcceptMail(sender)
        }

        Command::RcptTo(rcpt) => {
            if state != State::MailFrom && state != State::RcptTo {
                return Action::Reply(BAD_SEQUENCE.0, BAD_SEQUENCE.1);
            }
            if gates.tls_required && !gates.tls_active {
                return Action::Reply(Status::AuthRequired, "Must issue STARTTLS first");
            }
            Action::AcceptRcpt(rcpt)
        }

        Command::Data => {
            if state != State::RcptTo {
                return Action::Reply(BAD_SEQUENCE.0, BAD_SEQUENCE.1);
            }
            if gates.tls_required && !gates.tls_active {
                return Action::Reply(Status::AuthRequired, "Must issue STARTTLS first");
            }
            Action::BeginData
        }

        Command::Rset => Action::Reset,
        Command::Noop => Action::Noop,
        Command::Help => Action::Help,
        Command::Quit => Action::Quit,

        Command::Invalid(_) => Action::Reply(Status::ArgumentError, "Syntax error in arguments"),
        Command::Unknown(_) => Action::Reply(Status::NotImplemented, "Command not implemented"),
    }
}
