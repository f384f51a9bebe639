//! Credential selection.

use crate::config::LoginPolicy;

/// How the next login should be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginRoute {
    /// Renew with the stored SSO token, no user interaction.
    SilentRefresh,
    /// Answer a challenge with the paired device key.
    Biometric,
    /// Read the smartcard.
    Card,
}

impl LoginPolicy {
    /// Picks the route given whether a usable SSO token exists and whether
    /// the device is paired.
    #[must_use]
    pub fn route(self, sso_available: bool, paired: bool) -> LoginRoute {
        match self {
            Self::PreferSilentRefresh if sso_available => LoginRoute::SilentRefresh,
            Self::PreferSilentRefresh | Self::PreferBiometric if paired => LoginRoute::Biometric,
            Self::PreferBiometric if sso_available => LoginRoute::SilentRefresh,
            Self::PreferSilentRefresh | Self::PreferBiometric | Self::AlwaysCard => LoginRoute::Card,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefer_silent_refresh() {
        let policy = LoginPolicy::PreferSilentRefresh;
        assert_eq!(policy.route(true, true), LoginRoute::SilentRefresh);
        assert_eq!(policy.route(false, true), LoginRoute::Biometric);
        assert_eq!(policy.route(false, false), LoginRoute::Card);
    }

    #[test]
    fn test_prefer_biometric() {
        let policy = LoginPolicy::PreferBiometric;
        assert_eq!(policy.route(true, true), LoginRoute::Biometric);
        assert_eq!(policy.route(true, false), LoginRoute::SilentRefresh);
        assert_eq!(policy.route(false, false), LoginRoute::Card);
    }

    #[test]
    fn test_always_card() {
        let policy = LoginPolicy::AlwaysCard;
        assert_eq!(policy.route(true, true), LoginRoute::Card);
        assert_eq!(policy.route(false, false), LoginRoute::Card);
    }
}
