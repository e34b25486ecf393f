//! Provider Session (spec.md §4.7): adapts a remote duplex audio endpoint
//! behind the same [`Session`] contract as [`super::LocalSession`].

use super::{Session, SessionEvent, SessionStartContext};
use crate::audio::AudioFrameBus;
use crate::error::{CoreError, Result};
use crate::model::AudioFrame;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{mpsc, Mutex};

/// Transport to a remote duplex audio endpoint. Translates 16 kHz PCM to
/// and from the remote wire format; implementations typically wrap a
/// WebSocket or gRPC stream to a hosted voice API.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    async fn send_audio(&self, frame: &AudioFrame) -> Result<()>;
    /// Poll once for whatever the remote has produced since the last call:
    /// decoded audio plus any transcript/turn events.
    async fn poll(&self) -> Result<RemotePoll>;
    async fn stop_output(&self) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// One batch of remote-produced output.
#[derive(Debug, Clone, Default)]
pub struct RemotePoll {
    pub audio: Vec<AudioFrame>,
    pub events: Vec<SessionEvent>,
}

/// Adapts a [`RemoteEndpoint`] to the uniform [`Session`] capability set.
pub struct ProviderSession<E: RemoteEndpoint> {
    bus: AudioFrameBus,
    endpoint: E,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<mpsc::Receiver<SessionEvent>>,
    outbound_seq: AtomicU64,
    closed: AtomicBool,
}

impl<E: RemoteEndpoint> ProviderSession<E> {
    #[must_use]
    pub fn new(bus: AudioFrameBus, endpoint: E) -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            bus,
            endpoint,
            events_tx,
            events_rx: Mutex::new(events_rx),
            outbound_seq: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Drain whatever the remote has produced and route it onto the bus /
    /// event queue. Call this from the session's poll loop.
    pub async fn pump(&self) -> Result<()> {
        let polled = self.endpoint.poll().await?;
        for mut frame in polled.audio {
            frame.seq = self.outbound_seq.fetch_add(1, Ordering::Relaxed);
            self.bus.outbound.push(frame);
        }
        for event in polled.events {
            if self.events_tx.send(event).await.is_err() {
                return Err(CoreError::Channel(
                    "provider session event consumer gone".to_owned(),
                ));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<E: RemoteEndpoint> Session for ProviderSession<E> {
    async fn start(&self, _ctx: SessionStartContext) -> Result<()> {
        Ok(())
    }

    async fn push_frame(&self, frame: AudioFrame) -> Result<()> {
        self.endpoint.send_audio(&frame).await?;
        self.pump().await
    }

    async fn next_event(&self) -> Option<SessionEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn stop_output(&self) -> Result<()> {
        self.endpoint.stop_output().await?;
        while self.bus.outbound.len() > 2 {
            self.bus.outbound.pop();
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        self.endpoint.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;

    #[derive(Default)]
    struct FakeEndpoint {
        pending: SyncMutex<RemotePoll>,
        stop_calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl RemoteEndpoint for FakeEndpoint {
        async fn send_audio(&self, _frame: &AudioFrame) -> Result<()> {
            Ok(())
        }

        async fn poll(&self) -> Result<RemotePoll> {
            Ok(std::mem::take(&mut *self.pending.lock()))
        }

        async fn stop_output(&self) -> Result<()> {
            self.stop_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_frame_forwards_to_endpoint_and_pumps_audio_back() {
        let endpoint = FakeEndpoint::default();
        endpoint
            .pending
            .lock()
            .audio
            .push(AudioFrame::silence(0, 0));
        let session = ProviderSession::new(AudioFrameBus::default(), endpoint);

        session
            .push_frame(AudioFrame::silence(0, 0))
            .await
            .expect("push");
        assert_eq!(session.bus.outbound.len(), 1);
    }

    #[tokio::test]
    async fn stop_output_delegates_to_endpoint() {
        let endpoint = FakeEndpoint::default();
        let session = ProviderSession::new(AudioFrameBus::default(), endpoint);
        session.stop_output().await.expect("stop");
        assert_eq!(
            session.endpoint.stop_calls.load(Ordering::Relaxed),
            1
        );
    }
}
