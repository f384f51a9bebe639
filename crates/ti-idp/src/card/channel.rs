//! Boundary to the platform's card radio.

use async_trait::async_trait;

use super::apdu::{CommandApdu, ResponseApdu};
use super::error::CardError;

/// A connected card.
#[async_trait]
pub trait CardChannel: Send {
    /// Sends one serialized command APDU and returns the raw response.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if the radio link fails.
    async fn transceive(&mut self, command: &[u8]) -> Result<Vec<u8>, CardError>;

    /// Closes the link. Idempotent; also called when a session is dropped
    /// mid-operation.
    fn disconnect(&mut self);
}

/// Something a card can be presented to.
#[async_trait]
pub trait CardReader: Send + Sync {
    /// Waits for a card and connects to it.
    ///
    /// # Errors
    ///
    /// Returns `Connection` if no card could be connected.
    async fn connect(&self) -> Result<Box<dyn CardChannel>, CardError>;
}

/// Sends a command and parses the response.
pub(crate) async fn transmit(
    channel: &mut dyn CardChannel,
    command: &CommandApdu,
) -> Result<ResponseApdu, CardError> {
    tracing::trace!(?command, "APDU out");
    let raw = channel.transceive(&command.to_bytes()).await?;
    let response = ResponseApdu::parse(&raw)?;
    tracing::trace!(?response, "APDU in");
    Ok(response)
}

/// A connected channel that is closed when dropped, including when the
/// operation owning it is cancelled halfway through.
pub(crate) struct ConnectedChannel(Box<dyn CardChannel>);

impl ConnectedChannel {
    pub(crate) fn new(channel: Box<dyn CardChannel>) -> Self {
        Self(channel)
    }

    pub(crate) fn as_mut(&mut self) -> &mut dyn CardChannel {
        self.0.as_mut()
    }
}

impl Drop for ConnectedChannel {
    fn drop(&mut self) {
        self.0.disconnect();
        tracing::debug!("Card channel closed");
    }
}
