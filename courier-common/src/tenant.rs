//! Tenant identifier newtype
//!
//! Wraps tenant (organization) identifiers to prevent accidentally passing
//! recipient phone numbers or other strings where a tenant id is expected.

use std::{
    fmt::{self, Display},
    ops::Deref,
    sync::Arc,
};

use serde::{Deserialize, Serialize};

/// An owning-organization identifier
///
/// This newtype prevents accidentally passing recipient addresses or other
/// strings where tenant identifiers are expected. The `Arc<str>` backing
/// makes clones cheap enough to use as map keys across the rate limiter
/// and statistics partitions.
///
/// # Examples
///
/// ```
/// use courier_common::TenantId;
///
/// let tenant = TenantId::new("org_1182");
/// assert_eq!(tenant.as_str(), "org_1182");
///
/// let tenant: TenantId = "org_2240".into();
/// assert_eq!(tenant.as_str(), "org_2240");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct TenantId(Arc<str>);

impl TenantId {
    /// Create a new `TenantId` from any type that can be converted to `Arc<str>`
    ///
    /// # Examples
    ///
    /// ```
    /// use courier_common::TenantId;
    ///
    /// let tenant = TenantId::new("org_1182");
    /// let tenant = TenantId::new(String::from("org_1182"));
    /// ```
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    /// Get the tenant id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert the tenant id into the inner `Arc<str>`
    #[must_use]
    pub fn into_inner(self) -> Arc<str> {
        self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for TenantId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<String> for TenantId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<Arc<str>> for TenantId {
    fn from(s: Arc<str>) -> Self {
        Self(s)
    }
}

impl From<TenantId> for Arc<str> {
    fn from(tenant: TenantId) -> Self {
        tenant.0
    }
}

impl From<&TenantId> for Arc<str> {
    fn from(tenant: &TenantId) -> Self {
        tenant.0.clone()
    }
}
