//! Subject validation and wildcard matching.
//!
//! Subjects are `.`-separated tokens. In a subscription pattern `*` matches
//! exactly one token and `>` matches one or more trailing tokens.

use crate::{Error, Result};

pub const SINGLE_WILDCARD: &str = "*";
pub const TAIL_WILDCARD: &str = ">";

/// Checks a literal publish subject (no wildcards, no empty tokens).
pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.is_empty() {
        return Err(Error::InvalidArgument("subject is required".to_string()));
    }
    for token in subject.split('.') {
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!("invalid subject '{subject}'")));
        }
        if token == SINGLE_WILDCARD || token == TAIL_WILDCARD {
            return Err(Error::InvalidArgument(format!(
                "subject '{subject}' cannot contain wildcards"
            )));
        }
    }
    Ok(())
}

/// Checks a subscription pattern. `>` is only allowed as the last token.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidArgument("subject is required".to_string()));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (idx, token) in tokens.iter().enumerate() {
        if token.is_empty() || token.contains(char::is_whitespace) {
            return Err(Error::InvalidArgument(format!("invalid subject '{pattern}'")));
        }
        if *token == TAIL_WILDCARD && idx + 1 != tokens.len() {
            return Err(Error::InvalidArgument(format!(
                "'>' must be the last token in '{pattern}'"
            )));
        }
    }
    Ok(())
}

pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(TAIL_WILDCARD), Some(_)) => return true,
            (Some(SINGLE_WILDCARD), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_and_wildcard_matching() {
        assert!(matches("foo.bar", "foo.bar"));
        assert!(!matches("foo.bar", "foo.baz"));
        assert!(matches("foo.*", "foo.bar"));
        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(!matches("foo.*", "foo"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(!matches("foo.>", "foo"));
        assert!(matches("_INBOX.abcdefgh.*", "_INBOX.abcdefgh.Z9x0aB7q"));
    }

    #[test]
    fn subject_validation() {
        assert!(validate_subject("ORDERS.new").is_ok());
        assert!(validate_subject("").is_err());
        assert!(validate_subject("ORDERS..new").is_err());
        assert!(validate_subject("ORDERS.*").is_err());
        assert!(validate_subject("ORDERS new").is_err());
        assert!(validate_pattern("ORDERS.>").is_ok());
        assert!(validate_pattern("ORDERS.>.x").is_err());
    }
}
