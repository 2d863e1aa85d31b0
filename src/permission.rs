use crate::error::{Error, Result};
use std::borrow::Borrow;
use std::fmt;

/// Wildcard marker usable as resource and/or action.
pub const WILDCARD: &str = "*";

/// Permission string wrapper (`resource:action`).
///
/// The resource may itself contain `:` separated segments; the action is
/// always the last segment.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Permission(String);

impl Permission {
    /// Parses `value` with [`DefaultPermissionValidator`], trimmed and lowercased.
    pub fn new(value: impl AsRef<str>) -> Result<Self> {
        Self::new_with(value, &DefaultPermissionValidator, true)
    }

    /// Parses `value` with a caller-supplied validator. `normalize` trims and
    /// lowercases first.
    pub fn new_with(
        value: impl AsRef<str>,
        validator: &dyn PermissionValidator,
        normalize: bool,
    ) -> Result<Self> {
        let trimmed = value.as_ref().trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidPermission(
                "permission must not be empty".to_string(),
            ));
        }
        let normalized = if normalize {
            trimmed.to_ascii_lowercase()
        } else {
            trimmed.to_string()
        };
        validator.validate(&normalized)?;
        Ok(Self(normalized))
    }

    /// Builds a permission from separate resource and action parts.
    pub fn from_parts(resource: impl AsRef<str>, action: impl AsRef<str>) -> Result<Self> {
        Self::new(format!("{}:{}", resource.as_ref().trim(), action.as_ref().trim()))
    }

    /// Maps an HTTP method and request path to the permission it requires.
    ///
    /// `/api` and version (`v1`, `v2`, ...) prefixes are skipped; the first
    /// remaining segment is the resource. `GET` on a collection is `read`,
    /// `GET` on an item is `view`.
    pub fn from_endpoint(method: &str, path: &str) -> Result<Self> {
        let mut parts: Vec<&str> = path
            .trim_start_matches('/')
            .split('/')
            .filter(|part| !part.is_empty())
            .collect();
        if parts.len() > 1 && parts[0].eq_ignore_ascii_case("api") {
            parts.remove(0);
        }
        if parts.len() > 1 && is_version_segment(parts[0]) {
            parts.remove(0);
        }
        let Some(resource) = parts.first().copied() else {
            return Self::from_parts("api", "access");
        };

        let action = match method.to_ascii_uppercase().as_str() {
            "GET" if parts.len() > 1 => "view",
            "GET" => "read",
            "POST" => "create",
            "PUT" | "PATCH" => "update",
            "DELETE" => "delete",
            _ => "access",
        };
        Self::from_parts(resource, action)
    }

    /// Creates a permission from a trusted string without validation.
    pub fn from_string(value: String) -> Self {
        Self(value)
    }

    /// Returns the underlying string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resource part (everything before the last `:`).
    pub fn resource(&self) -> &str {
        split_permission(&self.0).map_or("", |(resource, _)| resource)
    }

    /// Action part (after the last `:`).
    pub fn action(&self) -> &str {
        split_permission(&self.0).map_or("", |(_, action)| action)
    }

    /// Whether either part is the wildcard marker.
    pub fn is_wildcard(&self) -> bool {
        split_permission(&self.0)
            .is_some_and(|(resource, action)| has_wildcard_segment(resource, action))
    }

    /// Whether this is the full administrative `*:*` grant.
    pub fn is_full_wildcard(&self) -> bool {
        self.resource() == WILDCARD && self.action() == WILDCARD
    }
}

fn is_version_segment(segment: &str) -> bool {
    segment.len() > 1
        && segment.starts_with(['v', 'V'])
        && segment[1..].chars().all(|ch| ch.is_ascii_digit())
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Permission {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Permission {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for Permission {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        Self::new(value)
    }
}

impl From<String> for Permission {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

/// Hook for deployments that restrict permission names further.
pub trait PermissionValidator: Send + Sync {
    fn validate(&self, value: &str) -> Result<()>;
}

/// Lowercase ascii, digits, `_` and `-` per segment; `*` allowed as a whole segment.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPermissionValidator;

impl PermissionValidator for DefaultPermissionValidator {
    fn validate(&self, value: &str) -> Result<()> {
        let (resource, action) = split_permission(value).ok_or_else(|| {
            Error::InvalidPermission("permission must be in resource:action format".to_string())
        })?;
        if resource.is_empty() || action.is_empty() {
            return Err(Error::InvalidPermission(
                "permission must not have empty segments".to_string(),
            ));
        }
        for segment in resource.split(':') {
            if !is_valid_segment(segment) {
                return Err(Error::InvalidPermission(
                    "resource segment contains invalid characters".to_string(),
                ));
            }
        }
        if !is_valid_segment(action) {
            return Err(Error::InvalidPermission(
                "action segment contains invalid characters".to_string(),
            ));
        }
        Ok(())
    }
}

fn is_valid_segment(segment: &str) -> bool {
    if segment == WILDCARD {
        return true;
    }
    if segment.is_empty() {
        return false;
    }
    segment
        .chars()
        .all(|ch| matches!(ch, 'a'..='z' | '0'..='9' | '_' | '-'))
}

pub(crate) fn split_permission(value: &str) -> Option<(&str, &str)> {
    value.rsplit_once(':')
}

fn has_wildcard_segment(resource: &str, action: &str) -> bool {
    action == WILDCARD || resource == WILDCARD
}

/// Returns whether `granted` satisfies `required`.
///
/// With wildcards enabled, `*:x` matches action `x` on any resource, `r:*`
/// matches any action on `r`, and `*:*` matches everything. With wildcards
/// disabled a wildcard grant matches nothing.
pub(crate) fn permission_matches(
    granted: &Permission,
    required: &Permission,
    enable_wildcard: bool,
) -> bool {
    let Some((g_res, g_act)) = split_permission(granted.as_str()) else {
        return false;
    };
    let Some((r_res, r_act)) = split_permission(required.as_str()) else {
        return false;
    };
    if !enable_wildcard {
        return !has_wildcard_segment(g_res, g_act) && g_res == r_res && g_act == r_act;
    }

    let resource_ok = g_res == WILDCARD || g_res == r_res;
    let action_ok = g_act == WILDCARD || g_act == r_act;
    resource_ok && action_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perm(value: &str) -> Permission {
        Permission::try_from(value).unwrap()
    }

    #[test]
    fn try_from_should_trim_and_lowercase() {
        let permission = Permission::try_from(" Users:Read ").unwrap();
        assert_eq!(permission.as_str(), "users:read");
        assert_eq!(permission.resource(), "users");
        assert_eq!(permission.action(), "read");
    }

    #[test]
    fn try_from_should_reject_empty_segments() {
        let result = Permission::try_from(":read");
        assert!(matches!(result, Err(Error::InvalidPermission(_))));
    }

    #[test]
    fn full_wildcard_satisfies_every_check() {
        let admin = perm("*:*");
        assert!(admin.is_full_wildcard());
        assert!(permission_matches(&admin, &perm("users:delete"), true));
        assert!(permission_matches(&admin, &perm("billing:invoice:void"), true));
    }

    #[test]
    fn partial_wildcard_is_confined_to_its_resource() {
        let users_any = perm("users:*");
        assert!(permission_matches(&users_any, &perm("users:delete"), true));
        assert!(!permission_matches(&users_any, &perm("roles:delete"), true));

        let any_read = perm("*:read");
        assert!(permission_matches(&any_read, &perm("orders:read"), true));
        assert!(!permission_matches(&any_read, &perm("orders:write"), true));
    }

    #[test]
    fn wildcard_grant_is_ignored_when_disabled() {
        let granted = perm("users:*");
        assert!(!permission_matches(&granted, &perm("users:read"), false));
        assert!(!permission_matches(&granted, &perm("users:*"), false));
        assert!(permission_matches(&perm("users:read"), &perm("users:read"), false));
    }

    #[test]
    fn endpoint_mapping_follows_http_method() {
        let cases = [
            ("GET", "/api/v1/users", "users:read"),
            ("GET", "/api/v1/users/42", "users:view"),
            ("POST", "/v2/orders", "orders:create"),
            ("PATCH", "/roles/r1", "roles:update"),
            ("PUT", "/roles/r1", "roles:update"),
            ("DELETE", "/api/groups/g1", "groups:delete"),
            ("OPTIONS", "/groups", "groups:access"),
            ("GET", "/", "api:access"),
        ];
        for (method, path, expected) in cases {
            let permission = Permission::from_endpoint(method, path).unwrap();
            assert_eq!(permission.as_str(), expected, "{method} {path}");
        }
    }
}
