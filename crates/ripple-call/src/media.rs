//! Trait seams to the platform media stack.
//!
//! Device capture and the actual peer connection live outside this crate;
//! signaling only needs to acquire a local stream, drive SDP negotiation
//! and forward ICE candidates.  [`NullMediaProvider`] implements the seams
//! without touching any hardware, for headless mode and tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use ripple_shared::types::CallKind;

use crate::error::MediaError;

/// A local capture stream with independently toggleable tracks.
pub trait MediaStream: Send + Sync {
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn audio_enabled(&self) -> bool;
    fn video_enabled(&self) -> bool;

    /// Stop every track and release the devices.  Idempotent.
    fn stop(&self);
}

/// One peer connection's negotiation surface.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<String, MediaError>;
    async fn create_answer(&self) -> Result<String, MediaError>;
    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError>;

    /// Candidates are applied in whatever order the transport delivers them.
    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError>;

    /// Close the connection.  Idempotent.
    async fn close(&self);
}

/// Factory for streams and peer connections.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn acquire(&self, kind: CallKind) -> Result<Arc<dyn MediaStream>, MediaError>;

    /// Create a peer connection with the local stream's tracks attached.
    /// The receiver yields locally gathered ICE candidates; it closes when
    /// gathering completes or the connection is closed.
    async fn connect(
        &self,
        stream: Arc<dyn MediaStream>,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<String>), MediaError>;
}

/// A media stack that produces placeholder SDP and no real traffic.
///
/// Tracks every acquisition and connection so tests can assert on resource
/// lifecycles.
#[derive(Default)]
pub struct NullMediaProvider {
    acquisitions: AtomicUsize,
    streams: Mutex<Vec<Arc<NullStream>>>,
    connections: Mutex<Vec<Arc<NullConnection>>>,
    /// Candidates each connection pretends to gather.
    candidates: Vec<String>,
    fail_acquire: AtomicBool,
    fail_connect: AtomicBool,
}

impl NullMediaProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            candidates: vec!["candidate:0 1 udp 2122252543 192.0.2.1 49152 typ host".into()],
            ..Self::default()
        })
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<Arc<NullStream>> {
        self.streams.lock().expect("media lock").clone()
    }

    pub fn connections(&self) -> Vec<Arc<NullConnection>> {
        self.connections.lock().expect("media lock").clone()
    }

    /// Make every `acquire` fail, as if the user denied device access.
    pub fn set_fail_acquire(&self, fail: bool) {
        self.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Make every `connect` fail, as if negotiation setup threw.
    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaProvider for NullMediaProvider {
    async fn acquire(&self, kind: CallKind) -> Result<Arc<dyn MediaStream>, MediaError> {
        if self.fail_acquire.load(Ordering::SeqCst) {
            return Err(MediaError::Acquisition("device access denied".into()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let stream = Arc::new(NullStream {
            audio: AtomicBool::new(true),
            video: AtomicBool::new(kind == CallKind::Video),
            stopped: AtomicBool::new(false),
        });
        self.streams.lock().expect("media lock").push(stream.clone());
        Ok(stream)
    }

    async fn connect(
        &self,
        _stream: Arc<dyn MediaStream>,
    ) -> Result<(Arc<dyn PeerConnection>, mpsc::Receiver<String>), MediaError> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(MediaError::Negotiation("peer connection setup failed".into()));
        }
        let (tx, rx) = mpsc::channel(8);
        for candidate in &self.candidates {
            let _ = tx.send(candidate.clone()).await;
        }
        // The sender is dropped here, so gathering reads as complete.
        let connection = Arc::new(NullConnection::default());
        self.connections
            .lock()
            .expect("media lock")
            .push(connection.clone());
        Ok((connection, rx))
    }
}

pub struct NullStream {
    audio: AtomicBool,
    video: AtomicBool,
    stopped: AtomicBool,
}

impl NullStream {
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaStream for NullStream {
    fn set_audio_enabled(&self, enabled: bool) {
        self.audio.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, enabled: bool) {
        self.video.store(enabled, Ordering::SeqCst);
    }

    fn audio_enabled(&self) -> bool {
        self.audio.load(Ordering::SeqCst)
    }

    fn video_enabled(&self) -> bool {
        self.video.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct NullConnection {
    remote_description: Mutex<Option<String>>,
    applied_candidates: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl NullConnection {
    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().expect("media lock").clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.applied_candidates.lock().expect("media lock").clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for NullConnection {
    async fn create_offer(&self) -> Result<String, MediaError> {
        Ok("v=0\r\no=- 0 0 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\na=sendrecv\r\n".into())
    }

    async fn create_answer(&self) -> Result<String, MediaError> {
        if self.remote_description.lock().expect("media lock").is_none() {
            return Err(MediaError::Negotiation(
                "answer requested before remote offer".into(),
            ));
        }
        Ok("v=0\r\no=- 0 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\na=sendrecv\r\n".into())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<(), MediaError> {
        *self.remote_description.lock().expect("media lock") = Some(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &str) -> Result<(), MediaError> {
        self.applied_candidates
            .lock()
            .expect("media lock")
            .push(candidate.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
