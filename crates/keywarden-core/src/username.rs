// ABOUTME: Validated POSIX usernames and derivation of a default from a login name.
// ABOUTME: Derived names are lowercase, letter-first, and at most 32 characters.

use crate::error::{AuthorizationError, Result};
use std::fmt;
use std::str::FromStr;

/// Longest username the in-guest agent accepts.
pub const MAX_USERNAME_LEN: usize = 32;

/// A username that can be provisioned on the VM.
///
/// Allowed characters are lowercase ASCII letters, digits, `_`, `.` and `-`;
/// the first character must be a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PosixUsername(String);

impl PosixUsername {
    /// Validate an explicitly chosen username.
    ///
    /// # Errors
    /// Returns `AuthorizationError::Validation` if the name is empty, too
    /// long, or contains characters outside the allowed set.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(AuthorizationError::Validation(format!(
                "'{name}' is not a valid POSIX username"
            )))
        }
    }

    pub fn is_valid(name: &str) -> bool {
        let mut chars = name.chars();
        let Some(first) = chars.next() else {
            return false;
        };

        name.len() <= MAX_USERNAME_LEN
            && (first.is_ascii_lowercase() || first.is_ascii_digit())
            && chars.all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '.' | '-')
            })
    }

    /// Derive a username from a login name such as an email address.
    ///
    /// Only the part before `@` is used. It is lowercased, every other
    /// character is mapped to `_`, a `g` is prepended unless it starts with a
    /// letter, and the result is cut to 32 characters.
    pub fn suggest(login_name: &str) -> Self {
        let local_part = login_name
            .split_once('@')
            .map_or(login_name, |(local, _)| local);

        let mut name: String = local_part
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            name.insert(0, 'g');
        }

        // Only ASCII characters remain, so byte truncation is safe.
        name.truncate(MAX_USERNAME_LEN);
        Self(name)
    }

    /// Use `preferred` if given, else derive from `login_name`.
    pub fn resolve(preferred: Option<&str>, login_name: &str) -> Result<Self> {
        match preferred {
            Some(name) => Self::new(name),
            None => Ok(Self::suggest(login_name)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PosixUsername {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PosixUsername {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for PosixUsername {
    type Err = AuthorizationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suggest_from_email() {
        assert_eq!(PosixUsername::suggest("j@ex.ample").as_str(), "j");
        assert_eq!(
            PosixUsername::suggest("User.Name@example.com").as_str(),
            "user_name"
        );
    }

    #[test]
    fn test_suggest_prefixes_non_letter_start() {
        assert_eq!(PosixUsername::suggest("123@x.com").as_str(), "g123");
        assert_eq!(PosixUsername::suggest("_x@x.com").as_str(), "g_x");
        assert_eq!(PosixUsername::suggest("@x.com").as_str(), "g");
    }

    #[test]
    fn test_suggest_truncates() {
        let suggested = PosixUsername::suggest("ABCDEFGHIJKLMNOPQRSTUVWXYZabcxyz0@ex.ample");
        assert_eq!(suggested.as_str(), "abcdefghijklmnopqrstuvwxyzabcxyz");
        assert_eq!(suggested.as_str().len(), MAX_USERNAME_LEN);
    }

    #[test]
    fn test_suggest_maps_non_ascii() {
        assert_eq!(PosixUsername::suggest("jürgen@ex.ample").as_str(), "j_rgen");
    }

    #[test]
    fn test_suggest_without_at_sign() {
        assert_eq!(PosixUsername::suggest("Alice").as_str(), "alice");
    }

    #[test]
    fn test_suggested_names_are_valid() {
        for login in ["a@b", "9@b", "x.y-z@b", "", "Ünïcode@b", &"q".repeat(80)] {
            let suggested = PosixUsername::suggest(login);
            assert!(
                PosixUsername::is_valid(suggested.as_str()),
                "suggestion for {login:?} should be valid"
            );
            assert!(suggested.as_str().starts_with(|c: char| c.is_ascii_lowercase()));
        }
    }

    #[test]
    fn test_new_accepts_valid_names() {
        for name in ["user", "u1", "1user", "first.last", "a-b_c"] {
            assert!(PosixUsername::new(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_new_rejects_invalid_names() {
        let too_long = "a".repeat(MAX_USERNAME_LEN + 1);
        for name in ["", " ", "!user", "-user", "User", "us er", too_long.as_str()] {
            let err = PosixUsername::new(name).unwrap_err();
            assert!(matches!(err, AuthorizationError::Validation(_)));
        }
    }

    #[test]
    fn test_resolve() {
        let preferred = PosixUsername::resolve(Some("bob"), "alice@ex.ample").unwrap();
        assert_eq!(preferred.as_str(), "bob");

        let derived = PosixUsername::resolve(None, "alice@ex.ample").unwrap();
        assert_eq!(derived.as_str(), "alice");

        assert!(PosixUsername::resolve(Some("!bob"), "alice@ex.ample").is_err());
    }

    #[test]
    fn test_from_str() {
        let name: PosixUsername = "carol".parse().expect("should parse");
        assert_eq!(name.to_string(), "carol");
    }
}
