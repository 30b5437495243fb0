use serde::{Deserialize, Serialize};

use crate::address::Address;

/// The SMTP-level sender and recipients of a transaction, distinct from the
/// message's `From:`/`To:` headers. A `None` sender is the null reverse-path.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    sender: Option<Address>,
    recipients: Vec<Address>,
}

impl Envelope {
    #[inline]
    #[must_use]
    pub const fn sender(&self) -> Option<&Address> {
        self.sender.as_ref()
    }

    #[inline]
    pub const fn sender_mut(&mut self) -> &mut Option<Address> {
        &mut self.sender
    }

    #[inline]
    #[must_use]
    pub fn recipients(&self) -> &[Address] {
        &self.recipients
    }

    #[inline]
    pub fn push_recipient(&mut self, rcpt: Address) {
        self.recipients.push(rcpt);
    }

    /// Clears the whole transaction, as `RSET` and `STARTTLS` require.
    pub fn clear(&mut self) {
        self.sender = None;
        self.recipients.clear();
    }

    /// The reverse-path rendered for the queue file, `<>` for the null sender.
    #[must_use]
    pub fn reverse_path(&self) -> String {
        self.sender
            .as_ref()
            .map_or_else(|| "<>".to_string(), |s| format!("<{s}>"))
    }
}

#[cfg(test)]
mod test {
    use super::Envelope;
    use crate::address::Address;

    #[test]
    fn clear_resets_transaction() {
        let mut envelope = Envelope::default();
        *envelope.sender_mut() = Some(Address::parse("a@example.org").unwrap());
        envelope.push_recipient(Address::parse("b@example.net").unwrap());

        envelope.clear();
        assert!(envelope.sender().is_none());
        assert!(envelope.recipients().is_empty());
    }

    #[test]
    fn null_reverse_path() {
        assert_eq!(Envelope::default().reverse_path(), "<>");
    }
}
