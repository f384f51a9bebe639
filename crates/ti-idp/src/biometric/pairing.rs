//! Pairing and alternative-authentication payloads.

use p256::PublicKey;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::challenge::IdpChallenge;
use crate::trust::Certificate;

/// Version tag of [`PairingData`].
pub const PAIRING_DATA_VERSION: &str = "1.0";
/// Version tag of [`RegistrationData`].
pub const REGISTRATION_DATA_VERSION: &str = "1.0";
/// Version tag of [`AuthenticationData`].
pub const AUTHENTICATION_DATA_VERSION: &str = "1.0";

/// Authentication methods asserted by a biometric login.
pub const BIOMETRIC_AMR: [&str; 3] = ["mfa", "hwk", "generic-biometric"];

/// Hardware and software description of the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    /// User-visible device name.
    pub name: String,
    /// Device type details.
    pub device_type: DeviceType,
}

/// Device type details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceType {
    /// Product name.
    pub product: String,
    /// Model identifier.
    pub model: String,
    /// Operating system.
    pub os: String,
    /// Operating system version.
    pub os_version: String,
    /// Manufacturer.
    pub manufacturer: String,
}

impl DeviceInformation {
    /// Creates a description of the running host.
    #[must_use]
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_type: DeviceType {
                product: "ti-idp".to_string(),
                model: std::env::consts::ARCH.to_string(),
                os: std::env::consts::OS.to_string(),
                os_version: String::new(),
                manufacturer: String::new(),
            },
        }
    }
}

/// An in-progress pairing attempt.
///
/// The device key exists from creation on; it is deleted again by
/// [`abort`](super::BiometricKeyCustodian::abort) unless the pairing is
/// committed.
#[derive(Debug, Clone)]
pub struct PairingSession {
    /// Attempt identifier for log correlation.
    pub id: Uuid,
    /// Key identifier (base64url of 32 random bytes), also the key tag.
    pub key_identifier: String,
    /// Public half of the device key.
    pub public_key: PublicKey,
    /// Device registered with the key.
    pub device_information: DeviceInformation,
    /// Start of the attempt.
    pub created_at: OffsetDateTime,
}

/// Binding of the device key to the card's authentication certificate,
/// signed by the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingData {
    /// Format version.
    pub pairing_data_version: String,
    /// DER SubjectPublicKeyInfo of the device key, base64.
    pub se_subject_public_key_info: String,
    /// Key identifier.
    pub key_identifier: String,
    /// Device product.
    pub product: String,
    /// Serial number of the card certificate, hex.
    pub serialnumber: String,
    /// Issuer of the card certificate, DER base64url.
    pub issuer: String,
    /// End of validity of the card certificate (Unix seconds).
    pub not_after: i64,
}

/// Registration sent to the pairing endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationData {
    /// Format version.
    pub registration_data_version: String,
    /// Card authentication certificate, DER base64.
    pub auth_cert: String,
    /// [`PairingData`] as compact JWS signed by the card.
    pub signed_pairing_data: String,
    /// Registered device.
    pub device_information: DeviceInformation,
}

/// Proof sent to the alternative authentication endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationData {
    /// Format version.
    pub authentication_data_version: String,
    /// Card authentication certificate of the pairing, DER base64url.
    pub auth_cert: String,
    /// The challenge token, verbatim.
    pub challenge_token: String,
    /// Authenticating device.
    pub device_information: DeviceInformation,
    /// Asserted authentication methods.
    pub amr: Vec<String>,
    /// Key identifier of the pairing.
    pub key_identifier: String,
    /// Expiry, the end of validity of the card certificate (Unix seconds).
    pub exp: i64,
}

/// Authentication data signed by the device key.
#[derive(Debug, Clone)]
pub struct SignedAuthenticationData {
    /// The challenge answered.
    pub original: IdpChallenge,
    /// Compact JWS over the [`AuthenticationData`].
    pub signed: String,
}

/// A committed pairing, kept per profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingRecord {
    /// Key identifier registered with the IDP.
    pub key_identifier: String,
    /// Card authentication certificate the key was bound to.
    pub certificate: Certificate,
}
