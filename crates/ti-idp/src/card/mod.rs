//! Smartcard secure-channel signer.
//!
//! A card session runs in three steps:
//!
//! 1. PACE with the card access number (CAN) over the reader's channel,
//!    which yields AES-256 secure-messaging keys (CBC encryption, CMAC
//!    integrity);
//! 2. PIN verification inside the secure channel;
//! 3. reading the authentication certificate and signing the challenge
//!    with the card's authentication key.
//!
//! [`SmartcardSigner`] owns the reader and enforces that at most one
//! session is open at a time. Cancellation and timeouts drop the running
//! operation, which closes the channel.
//!
//! The card administration commands (PIN change and PUK-based unblock)
//! share the same channel establishment.

pub mod apdu;
pub mod channel;
pub mod credential;
pub mod error;
pub(crate) mod pace;
pub(crate) mod secure_messaging;
pub mod session;
pub mod signer;

pub use apdu::{CommandApdu, ResponseApdu, StatusWord};
pub use channel::{CardChannel, CardReader};
pub use credential::{Can, CardCredential, Pin, Puk};
pub use error::CardError;
pub use session::{
    ChangeReferenceDataResponse, ResetRetryCounterMode, ResetRetryCounterResponse, SecureSession,
};
pub use signer::SmartcardSigner;
