use core::fmt::{self, Display, Formatter};

/// SMTP reply codes the server emits or the delivery client inspects.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    HelpMessage = 214,
    ServiceReady = 220,
    GoodBye = 221,
    AuthSuccessful = 235,
    Ok = 250,
    AuthContinue = 334,
    StartMailInput = 354,
    Unavailable = 421,
    ActionAborted = 451,
    InsufficientStorage = 452,
    TlsNotAvailable = 454,
    SyntaxError = 500,
    ArgumentError = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    ParameterNotImplemented = 504,
    AuthRequired = 530,
    AuthFailed = 535,
    Rejected = 550,
    ExceededStorage = 552,
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        (400..500).contains(&u16::from(self))
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        value as u16
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}

#[cfg(test)]
mod test {
    use super::Status;

    #[test]
    fn status() {
        assert!(Status::Rejected.is_permanent());
        assert!(!Status::Rejected.is_temporary());

        assert!(Status::Unavailable.is_temporary());
        assert!(!Status::Unavailable.is_permanent());

        assert_eq!(u16::from(Status::Rejected), 550);
        assert_eq!(Status::AuthContinue.to_string(), "334");
    }
}
