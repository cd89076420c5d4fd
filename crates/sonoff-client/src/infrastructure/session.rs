//! One connection session with a device.
//!
//! A [`Session`] is created for every (re)connect attempt and thrown away
//! when the socket goes.  It owns everything that must not survive a
//! reconnect: the device registry, the outgoing sequence counter and the
//! channel into the socket writer.  Callers hold it as a [`SessionHandle`];
//! once the connection manager tears the session down, writes through a
//! stale handle fail with [`TransportError::SessionGone`].

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sonoff_core::protocol::SequenceCounter;
use sonoff_core::{encode_frame, DeviceRegistry, Frame};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::application::dispatcher::{FrameSink, OptimisticUpdate};
use crate::error::{CommandError, TransportError};

/// Shared reference to a session.
pub type SessionHandle = Arc<Session>;

/// An encoded frame queued for the socket writer.
#[derive(Debug)]
pub(crate) struct OutboundFrame {
    pub(crate) text: String,
    /// Applied to the session registry once the frame is written.
    pub(crate) on_written: OptimisticUpdate,
    /// Receives the write result.
    pub(crate) ack: oneshot::Sender<Result<(), TransportError>>,
}

/// Capacity of the queue between callers and the socket writer.
const OUTBOUND_CAPACITY: usize = 32;

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    url: String,
    sequence: SequenceCounter,
    registry: Arc<DeviceRegistry>,
    outbound: mpsc::Sender<OutboundFrame>,
    last_activity: Mutex<Instant>,
}

impl Session {
    /// Creates a session with an empty registry and a clock-seeded sequence
    /// counter.  The returned receiver feeds the socket writer.
    pub(crate) fn new(url: impl Into<String>) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let session = Self {
            id: Uuid::new_v4(),
            url: url.into(),
            sequence: SequenceCounter::from_clock(),
            registry: Arc::new(DeviceRegistry::new()),
            outbound,
            last_activity: Mutex::new(Instant::now()),
        };
        (session, outbound_rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn next_sequence(&self) -> u64 {
        self.sequence.next()
    }

    /// Records inbound traffic.
    pub(crate) fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Time since the last inbound traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_activity().elapsed()
    }

    /// Queues an encoded frame and waits for the socket write.
    ///
    /// # Errors
    ///
    /// [`TransportError::SessionGone`] if the writer has stopped, or the
    /// write error reported by the writer.
    async fn queue(
        &self,
        text: String,
        on_written: OptimisticUpdate,
    ) -> Result<(), TransportError> {
        let (ack, ack_rx) = oneshot::channel();
        self.outbound
            .send(OutboundFrame {
                text,
                on_written,
                ack,
            })
            .await
            .map_err(|_| TransportError::SessionGone)?;
        ack_rx.await.map_err(|_| TransportError::SessionGone)?
    }
}

#[async_trait]
impl FrameSink for Session {
    async fn send_command(&self, frame: Frame, update: OptimisticUpdate) -> Result<(), CommandError> {
        let text = encode_frame(&frame)?;
        self.queue(text, update).await?;
        Ok(())
    }
}
