//! Biometric Key Custodian.
//!
//! A device-bound P-256 key, gated by user presence, replaces repeated card
//! reads once it has been paired:
//!
//! 1. [`BiometricKeyCustodian::create_pairing_session`] creates the key.
//! 2. [`BiometricKeyCustodian::sign_pairing_session`] has the card sign the
//!    binding between the key and its authentication certificate, so the
//!    IDP trusts the key through the card's chain.
//! 3. After the IDP accepted the registration,
//!    [`BiometricKeyCustodian::commit`] stores the [`PairingRecord`];
//!    otherwise [`BiometricKeyCustodian::abort`] deletes the key.
//! 4. Later logins call [`BiometricKeyCustodian::authentication_data`].
//!
//! The platform key store sits behind [`SecureKeyStore`].

pub mod custodian;
pub mod error;
pub mod keystore;
pub mod pairing;

pub use custodian::BiometricKeyCustodian;
pub use error::{BiometricError, KeyStoreError};
pub use keystore::{PromptOutcome, SecureKeyStore, SoftwareKeyStore};
pub use pairing::{
    AuthenticationData, DeviceInformation, DeviceType, PairingData, PairingRecord,
    PairingSession, RegistrationData, SignedAuthenticationData,
};
