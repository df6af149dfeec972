// ABOUTME: Authorized-key records and the line-oriented set stored in metadata.
// ABOUTME: Parses and writes the format read by the in-guest agent, including managed keys.

use crate::compute::{Metadata, MetadataItem};
use crate::error::{AuthorizationError, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Metadata key holding the authorized-key set.
pub const METADATA_KEY: &str = "ssh-keys";

/// Legacy single-key metadata field; instances using it are not supported.
pub const LEGACY_METADATA_KEY: &str = "sshKeys";

const MANAGED_KEY_TOKEN: &str = "google-ssh";

/// The agent expects a literal `+0000` offset without a colon.
const EXPIRE_ON_FORMAT: &str = "%Y-%m-%dT%H:%M:%S+0000";

const EXCERPT_LEN: usize = 48;

fn excerpt(text: &str) -> String {
    match text.char_indices().nth(EXCERPT_LEN) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

fn format_error(line: &str, reason: impl Into<String>) -> AuthorizationError {
    AuthorizationError::Format {
        what: "authorized key",
        excerpt: excerpt(line),
        reason: reason.into(),
    }
}

mod expire_on {
    use super::EXPIRE_ON_FORMAT;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(EXPIRE_ON_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_timestamp(&text).ok_or_else(|| {
            serde::de::Error::custom(format!("'{text}' is not a valid expiry timestamp"))
        })
    }
}

/// Accept RFC 3339 as well as the colon-less offset form the agent writes.
fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(parsed) = DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// The JSON payload that follows `google-ssh` in a managed record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedKeyMetadata {
    #[serde(rename = "userName")]
    pub owner_email: String,
    #[serde(rename = "expireOn", with = "expire_on")]
    pub expire_on: DateTime<Utc>,
}

/// Who put a key into metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyProvenance {
    /// Added by hand or by another tool; `owner` is an opaque trailing label.
    Unmanaged { owner: String },
    /// Added on behalf of an identity and expiring at a known time.
    Managed(ManagedKeyMetadata),
}

/// One authorized-key entry.
///
/// Two records are equal when username, key type and key match, regardless
/// of provenance.
#[derive(Debug, Clone)]
pub struct AuthorizedKeyRecord {
    pub posix_username: String,
    pub key_type: String,
    pub public_key: String,
    pub provenance: KeyProvenance,
}

impl AuthorizedKeyRecord {
    pub fn unmanaged(
        posix_username: impl Into<String>,
        key_type: impl Into<String>,
        public_key: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            posix_username: posix_username.into(),
            key_type: key_type.into(),
            public_key: public_key.into(),
            provenance: KeyProvenance::Unmanaged {
                owner: owner.into(),
            },
        }
    }

    pub fn managed(
        posix_username: impl Into<String>,
        key_type: impl Into<String>,
        public_key: impl Into<String>,
        owner_email: impl Into<String>,
        expire_on: DateTime<Utc>,
    ) -> Self {
        Self {
            posix_username: posix_username.into(),
            key_type: key_type.into(),
            public_key: public_key.into(),
            provenance: KeyProvenance::Managed(ManagedKeyMetadata {
                owner_email: owner_email.into(),
                expire_on,
            }),
        }
    }

    /// Parse one `username:keytype key owner` line.
    ///
    /// # Errors
    /// Returns `AuthorizationError::Format` with a truncated excerpt when
    /// the line has no username separator, lacks the key type, key or owner,
    /// separates fields by anything but a single space, or has an unreadable
    /// managed-key payload.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();

        let (posix_username, rest) = line
            .split_once(':')
            .ok_or_else(|| format_error(line, "missing username separator"))?;
        let mut fields = rest.splitn(3, ' ');
        let key_type = key_field(line, fields.next(), "missing key type")?;
        let public_key = key_field(line, fields.next(), "missing key")?;
        let owner = fields
            .next()
            .filter(|owner| !owner.is_empty())
            .ok_or_else(|| format_error(line, "missing owner"))?;

        let provenance = match owner.split_once(' ') {
            Some((MANAGED_KEY_TOKEN, payload)) if !payload.trim().is_empty() => {
                let metadata: ManagedKeyMetadata = serde_json::from_str(payload.trim())
                    .map_err(|e| {
                        format_error(line, format!("invalid managed key metadata: {e}"))
                    })?;
                KeyProvenance::Managed(metadata)
            }
            Some((MANAGED_KEY_TOKEN, _)) => {
                return Err(format_error(line, "managed key without metadata"))
            }
            _ if owner == MANAGED_KEY_TOKEN => {
                return Err(format_error(line, "managed key without metadata"))
            }
            _ => KeyProvenance::Unmanaged {
                owner: owner.to_string(),
            },
        };

        Ok(Self {
            posix_username: posix_username.to_string(),
            key_type: key_type.to_string(),
            public_key: public_key.to_string(),
            provenance,
        })
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.provenance, KeyProvenance::Managed(_))
    }

    pub fn expire_on(&self) -> Option<DateTime<Utc>> {
        match &self.provenance {
            KeyProvenance::Managed(metadata) => Some(metadata.expire_on),
            KeyProvenance::Unmanaged { .. } => None,
        }
    }

    /// Managed records expire once `expire_on` precedes `now`; unmanaged
    /// records never do.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_on().is_some_and(|expire_on| expire_on < now)
    }
}

/// Key type and key must be followed by exactly one space so that the
/// line serializes back unchanged.
fn key_field<'a>(line: &str, value: Option<&'a str>, missing: &str) -> Result<&'a str> {
    match value {
        None | Some("") => Err(format_error(line, missing)),
        Some(value) if value.contains(char::is_whitespace) => Err(format_error(
            line,
            "fields must be separated by single spaces",
        )),
        Some(value) => Ok(value),
    }
}

impl PartialEq for AuthorizedKeyRecord {
    fn eq(&self, other: &Self) -> bool {
        self.posix_username == other.posix_username
            && self.key_type == other.key_type
            && self.public_key == other.public_key
    }
}

impl Eq for AuthorizedKeyRecord {}

impl Hash for AuthorizedKeyRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.posix_username.hash(state);
        self.key_type.hash(state);
        self.public_key.hash(state);
    }
}

impl fmt::Display for AuthorizedKeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} {} ",
            self.posix_username, self.key_type, self.public_key
        )?;
        match &self.provenance {
            KeyProvenance::Unmanaged { owner } => f.write_str(owner),
            KeyProvenance::Managed(metadata) => {
                let payload = serde_json::to_string(metadata).map_err(|_| fmt::Error)?;
                write!(f, "{MANAGED_KEY_TOKEN} {payload}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Record(AuthorizedKeyRecord),
    /// A line that is not a record; kept verbatim.
    Opaque(String),
}

/// Ordered collection of authorized keys from a single metadata value.
///
/// Lines that cannot be parsed are carried along unchanged so that writing
/// the set back never loses foreign content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuthorizedKeySet {
    entries: Vec<Entry>,
}

impl AuthorizedKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a newline-separated metadata value.
    pub fn parse(value: &str) -> Self {
        let mut set = Self::new();
        for line in value.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match AuthorizedKeyRecord::parse(line) {
                Ok(record) if set.contains(&record) => {
                    tracing::debug!(username = %record.posix_username, "dropping duplicate authorized key");
                }
                Ok(record) => set.entries.push(Entry::Record(record)),
                Err(e) => {
                    tracing::debug!(error = %e, "keeping unrecognized authorized-key line");
                    set.entries.push(Entry::Opaque(line.to_string()));
                }
            }
        }
        set
    }

    /// The set stored under `ssh-keys` in `metadata`; empty if absent.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        metadata.get(METADATA_KEY).map(Self::parse).unwrap_or_default()
    }

    /// The set held by a single metadata item.
    ///
    /// # Errors
    /// Returns `AuthorizationError::Validation` if the item is not the
    /// `ssh-keys` item.
    pub fn from_item(item: &MetadataItem) -> Result<Self> {
        if item.key != METADATA_KEY {
            return Err(AuthorizationError::Validation(format!(
                "metadata item '{}' does not hold authorized keys",
                item.key
            )));
        }
        Ok(item.value.as_deref().map(Self::parse).unwrap_or_default())
    }

    /// Store the set under `ssh-keys` in `metadata`.
    pub fn write_to(&self, metadata: &mut Metadata) {
        metadata.set(METADATA_KEY, self.to_string());
    }

    pub fn records(&self) -> impl Iterator<Item = &AuthorizedKeyRecord> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Record(record) => Some(record),
            Entry::Opaque(_) => None,
        })
    }

    pub fn unrecognized_lines(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().filter_map(|entry| match entry {
            Entry::Opaque(line) => Some(line.as_str()),
            Entry::Record(_) => None,
        })
    }

    /// Number of records, not counting unrecognized lines.
    pub fn len(&self) -> usize {
        self.records().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, record: &AuthorizedKeyRecord) -> bool {
        self.records().any(|existing| existing == record)
    }

    /// Append `record` unless an equal one is already present.
    pub fn add(mut self, record: AuthorizedKeyRecord) -> Self {
        if !self.contains(&record) {
            self.entries.push(Entry::Record(record));
        }
        self
    }

    pub fn remove(mut self, record: &AuthorizedKeyRecord) -> Self {
        self.entries
            .retain(|entry| !matches!(entry, Entry::Record(existing) if existing == record));
        self
    }

    /// Drop managed records whose expiry precedes `now`.
    pub fn remove_expired(mut self, now: DateTime<Utc>) -> Self {
        self.entries
            .retain(|entry| !matches!(entry, Entry::Record(record) if record.is_expired(now)));
        self
    }
}

impl fmt::Display for AuthorizedKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.entries {
            let line = match entry {
                Entry::Record(record) => record.to_string(),
                Entry::Opaque(line) => line.clone(),
            };
            if line.is_empty() {
                continue;
            }
            if !first {
                f.write_str("\n")?;
            }
            f.write_str(&line)?;
            first = false;
        }
        Ok(())
    }
}
