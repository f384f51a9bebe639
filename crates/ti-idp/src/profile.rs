//! Local user profile identity the session is scoped to.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a local user profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    /// Creates a profile identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// The active profile together with the insurance identifier it is bound
/// to, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileContext {
    /// Profile identifier.
    pub id: ProfileId,

    /// Health-insurance identifier (`idNummer`) of the profile's owner.
    /// `None` until the first successful login binds the profile.
    pub insurance_id: Option<String>,
}

impl ProfileContext {
    /// Creates an unbound profile context.
    #[must_use]
    pub fn new(id: impl Into<ProfileId>) -> Self {
        Self {
            id: id.into(),
            insurance_id: None,
        }
    }

    /// Binds the profile to an insurance identifier.
    #[must_use]
    pub fn with_insurance_id(mut self, insurance_id: impl Into<String>) -> Self {
        self.insurance_id = Some(insurance_id.into());
        self
    }
}
