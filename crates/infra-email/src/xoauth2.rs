//! SASL authenticators for the sync IMAP client. The crate base64-encodes
//! the response itself, so these return the raw SASL strings.

use maildesk_oauth::xoauth2_string;

pub struct ImapXoauth2Authenticator<'a> {
    pub username: &'a str,
    pub access_token: &'a str,
}

impl imap::Authenticator for ImapXoauth2Authenticator<'_> {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        xoauth2_string(self.username, self.access_token)
    }
}

/// PLAIN with an empty authorization identity. Fallback for servers that
/// reject the LOGIN command but accept AUTH=PLAIN.
pub struct ImapPlainAuthenticator<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

impl imap::Authenticator for ImapPlainAuthenticator<'_> {
    type Response = String;

    fn process(&self, _challenge: &[u8]) -> Self::Response {
        format!("\x00{}\x00{}", self.username, self.password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imap::Authenticator as _;

    #[test]
    fn xoauth2_response_carries_bearer_token() {
        let auth = ImapXoauth2Authenticator {
            username: "support@example.com",
            access_token: "ya29.token",
        };
        assert_eq!(
            auth.process(b""),
            "user=support@example.com\x01auth=Bearer ya29.token\x01\x01"
        );
    }

    #[test]
    fn plain_response_uses_nul_separators() {
        let auth = ImapPlainAuthenticator {
            username: "u",
            password: "p",
        };
        assert_eq!(auth.process(b""), "\x00u\x00p");
    }
}
