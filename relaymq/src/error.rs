// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Common error types

use thiserror::Error;

use crate::frame::FrameError;
use crate::outbound::WriteError;
use crate::session::ack_queue::AckQueueError;
use crate::topics::{DeliveryError, SubscribeError};

/// Error type for a per-connection processor. The type of error is specified
/// by the value of [`ProcessorErrorKind`].
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ProcessorError(#[from] ProcessorErrorKind);

impl ProcessorError {
    /// Return the corresponding [`ProcessorErrorKind`] for this error
    #[must_use]
    pub fn kind(&self) -> &ProcessorErrorKind {
        &self.0
    }
}

impl From<AckQueueError> for ProcessorError {
    fn from(error: AckQueueError) -> Self {
        Self(error.into())
    }
}

impl From<WriteError> for ProcessorError {
    fn from(error: WriteError) -> Self {
        Self(error.into())
    }
}

/// Error kind for [`ProcessorError`].
#[derive(Error, Debug)]
pub enum ProcessorErrorKind {
    /// Framing or decoding the inbound stream failed.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// A packet was illegal for the current protocol state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// An acknowledgment could not be paired against its queue.
    #[error(transparent)]
    AckQueue(#[from] AckQueueError),
    /// The outbound write path failed.
    #[error("outbound write failed: {0}")]
    WriteFailed(#[from] WriteError),
    /// The topic manager rejected an operation.
    #[error(transparent)]
    Subscriber(#[from] SubscribeError),
    /// A subscriber handle could not receive a publish during fan-out.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    /// The peer closed the session with DISCONNECT.
    /// A sentinel terminating the loop, not a failure.
    #[error("peer disconnected")]
    PeerDisconnect,
}
