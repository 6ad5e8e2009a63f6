//! Identity types for microVMs.

use std::fmt;
use std::str::FromStr;

use ulid::Ulid;

use crate::IdError;

/// System-generated part of a [`VmId`], rendered as `vm_{ulid}`.
///
/// Minted once when a VM is first declared and never reused, so a VM
/// deleted and redeclared under the same name gets a new one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmUid(Ulid);

impl VmUid {
    pub const PREFIX: &'static str = "vm";

    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }

    #[must_use]
    pub const fn ulid(&self) -> Ulid {
        self.0
    }

    /// Last eight characters of the ULID, lowercased. Host device names are
    /// built from it since Linux caps interface names at 15 bytes.
    #[must_use]
    pub fn short(&self) -> String {
        let full = self.0.to_string();
        full[full.len() - 8..].to_ascii_lowercase()
    }

    pub fn parse(s: &str) -> Result<Self, IdError> {
        let (prefix, ulid) = s.split_once('_').ok_or(IdError::MissingSeparator)?;
        if prefix != Self::PREFIX {
            return Err(IdError::WrongPrefix(prefix.to_string()));
        }
        ulid.parse::<Ulid>()
            .map(Self)
            .map_err(|e| IdError::InvalidUlid(e.to_string()))
    }
}

impl Default for VmUid {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VmUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for VmUid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for VmUid {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for VmUid {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Maximum length of a namespace or name label.
pub const MAX_LABEL_LEN: usize = 63;

/// Identity of a microVM: an owner namespace, a name unique within it, and
/// the uid minted when the VM was first declared.
///
/// Canonical form is `{namespace}/{name}/{uid}`. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId {
    namespace: String,
    name: String,
    uid: VmUid,
}

impl VmId {
    /// Build an ID from validated parts.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        uid: VmUid,
    ) -> Result<Self, IdError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_label("namespace", &namespace)?;
        validate_label("name", &name)?;
        Ok(Self {
            namespace,
            name,
            uid,
        })
    }

    /// Build an ID with a freshly generated uid.
    pub fn generate(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, IdError> {
        Self::new(namespace, name, VmUid::new())
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> VmUid {
        self.uid
    }

    /// Parses `{namespace}/{name}/{uid}`.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        let mut parts = s.splitn(3, '/');
        let (Some(namespace), Some(name), Some(uid)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(IdError::Malformed(s.to_string()));
        };

        Self::new(namespace, name, uid.parse()?)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.name, self.uid)
    }
}

impl FromStr for VmId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for VmId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for VmId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Labels are DNS-style: lowercase alphanumerics, `-` and `.`, starting and
/// ending with an alphanumeric.
fn validate_label(field: &'static str, value: &str) -> Result<(), IdError> {
    let invalid = |reason| IdError::InvalidLabel {
        field,
        value: value.to_string(),
        reason,
    };

    if value.is_empty() {
        return Err(invalid("must not be empty"));
    }
    if value.len() > MAX_LABEL_LEN {
        return Err(invalid("longer than 63 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(invalid("only lowercase alphanumerics, '-' and '.' are allowed"));
    }

    let bytes = value.as_bytes();
    if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
        return Err(invalid("must start and end with an alphanumeric"));
    }

    Ok(())
}
