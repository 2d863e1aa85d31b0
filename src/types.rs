use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

const MAX_NAME_LEN: usize = 128;

pub(crate) fn validate_simple_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidId(format!("{kind} must not be empty")));
    }
    if trimmed.len() > MAX_NAME_LEN {
        return Err(Error::InvalidId(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if !trimmed.chars().all(is_allowed_name_char) {
        return Err(Error::InvalidId(format!(
            "{kind} contains invalid characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Trims a human-facing name; any printable characters are allowed.
pub(crate) fn validate_display_name(value: &str, kind: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::Validation(format!("{kind} must not be empty")));
    }
    if trimmed.chars().count() > MAX_NAME_LEN {
        return Err(Error::Validation(format!(
            "{kind} length must be <= {MAX_NAME_LEN}"
        )));
    }
    if trimmed.chars().any(char::is_control) {
        return Err(Error::Validation(format!(
            "{kind} contains control characters"
        )));
    }
    Ok(trimmed.to_string())
}

fn is_allowed_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, ':' | '_' | '-')
}

macro_rules! define_id_type {
    ($(#[$doc:meta])* $name:ident, $kind:expr) => {
        $(#[$doc])*
        #[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
        #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
        #[cfg_attr(feature = "serde", serde(transparent))]
        pub struct $name(String);

        impl $name {
            /// Creates a validated identifier.
            pub fn new(value: impl AsRef<str>) -> Result<Self> {
                validate_simple_name(value.as_ref(), $kind).map(Self)
            }

            /// Generates a fresh opaque identifier.
            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            /// Creates an identifier from a trusted string without validation.
            pub fn from_string(value: String) -> Self {
                Self(value)
            }

            /// Returns the underlying string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }

        impl TryFrom<&str> for $name {
            type Error = Error;

            fn try_from(value: &str) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self::from_string(value)
            }
        }
    };
}

define_id_type!(
    /// Organization identifier.
    OrganizationId,
    "organization id"
);
define_id_type!(
    /// Group identifier.
    GroupId,
    "group id"
);
define_id_type!(
    /// Principal identifier (user or service).
    PrincipalId,
    "principal id"
);
define_id_type!(
    /// Role identifier.
    RoleId,
    "role id"
);
define_id_type!(
    /// Permission record identifier.
    PermissionId,
    "permission id"
);
define_id_type!(
    /// Login session identifier shared by an access/refresh pair.
    SessionId,
    "session id"
);
define_id_type!(
    /// Unique token identifier (`jti`).
    TokenId,
    "token id"
);

impl PrincipalId {
    /// Creates a principal id from `kind` and `account_id` segments.
    ///
    /// Both segments are validated by [`PrincipalId::new`]. Callers should pass
    /// semantic pieces such as `("svc", "billing")` instead of formatting
    /// the raw id string at call sites.
    pub fn try_from_parts(kind: impl AsRef<str>, account_id: impl AsRef<str>) -> Result<Self> {
        let kind = validate_simple_name(kind.as_ref(), "principal kind")?;
        let account_id = validate_simple_name(account_id.as_ref(), "principal account id")?;
        Self::new(format!("{kind}:{account_id}"))
    }
}

/// Kind of identity subject to authorization.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PrincipalType {
    /// Human user.
    #[default]
    User,
    /// Machine identity.
    Service,
}

impl PrincipalType {
    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Service => "service",
        }
    }
}

impl fmt::Display for PrincipalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user or service identity.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Principal {
    pub id: PrincipalId,
    pub kind: PrincipalType,
}

impl Principal {
    /// Creates a user principal.
    pub fn user(id: PrincipalId) -> Self {
        Self {
            id,
            kind: PrincipalType::User,
        }
    }

    /// Creates a service principal.
    pub fn service(id: PrincipalId) -> Self {
        Self {
            id,
            kind: PrincipalType::Service,
        }
    }
}
