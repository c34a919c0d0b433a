//! Correlation tokens for asynchronous publish replies.
//!
//! Each context owns a private reply namespace `_INBOX.<8 chars>.` derived once
//! from a transport inbox. Every async publish gets a reply subject made of that
//! prefix plus an 8-symbol base-62 token; the token keys the pending registry.
//! Tokens only need to be unique for the lifetime of one context, so a fast
//! non-cryptographic generator is enough.

use rand::RngCore;

use crate::transport::INBOX_PREFIX;

pub const TOKEN_LEN: usize = 8;
pub const TOKEN_DIGITS: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;

/// Length of `_INBOX.` + 8 chars + `.`.
pub const REPLY_PREFIX_LEN: usize = INBOX_PREFIX.len() + TOKEN_LEN + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyPrefix {
    prefix: String,
}

impl ReplyPrefix {
    /// Builds the prefix from a transport inbox (`_INBOX.<unique>`).
    ///
    /// The last [`TOKEN_LEN`] characters of the inbox are kept; shorter inboxes
    /// are left-padded with `0` so the prefix always has the same length.
    pub fn from_inbox(inbox: &str) -> Self {
        let unique = inbox.strip_prefix(INBOX_PREFIX).unwrap_or(inbox);
        let chars: Vec<char> = unique.chars().filter(|c| *c != '.').collect();
        let tail = &chars[chars.len().saturating_sub(TOKEN_LEN)..];

        let mut prefix = String::with_capacity(REPLY_PREFIX_LEN);
        prefix.push_str(INBOX_PREFIX);
        for _ in tail.len()..TOKEN_LEN {
            prefix.push('0');
        }
        prefix.extend(tail.iter());
        prefix.push('.');
        Self { prefix }
    }

    pub fn as_str(&self) -> &str {
        &self.prefix
    }

    /// Subscription pattern covering every reply subject of this prefix.
    pub fn wildcard(&self) -> String {
        format!("{}*", self.prefix)
    }

    pub fn reply_subject(&self, token: &str) -> String {
        let mut subject = String::with_capacity(self.prefix.len() + token.len());
        subject.push_str(&self.prefix);
        subject.push_str(token);
        subject
    }

    /// Extracts the token from a reply subject, `None` when the subject does not
    /// belong to this prefix or the token has the wrong length.
    pub fn token_of<'a>(&self, subject: &'a str) -> Option<&'a str> {
        if subject.len() <= self.prefix.len() {
            return None;
        }
        let token = subject.strip_prefix(self.prefix.as_str())?;
        (token.len() == TOKEN_LEN).then_some(token)
    }
}

/// Maps one random `u64` onto [`TOKEN_LEN`] base-62 symbols.
pub fn new_token() -> String {
    encode(rand::thread_rng().next_u64())
}

fn encode(mut value: u64) -> String {
    let mut token = String::with_capacity(TOKEN_LEN);
    for _ in 0..TOKEN_LEN {
        token.push(TOKEN_DIGITS[(value % BASE) as usize] as char);
        value /= BASE;
    }
    token
}
