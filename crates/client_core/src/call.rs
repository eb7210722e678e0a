//! One-to-one call signaling.
//!
//! The engine only shepherds SDP and ICE between the relay and a
//! [`PeerSession`]; media capture and the actual peer connection live behind
//! traits so the engine can run headless. Remote ICE candidates that arrive
//! before the remote description is applied are queued on the call state and
//! drained exactly once.

use std::mem;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use shared::domain::{ContactKind, UserId};
use shared::protocol::ClientEvent;

use crate::{ClientUpdate, EngineError, Messenger};

/// Source of local media tracks.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    async fn capture_microphone(&self) -> Result<Arc<dyn MediaHandle>>;
}

/// A live capture. Dropping the handle does not stop the device; callers
/// release it explicitly.
pub trait MediaHandle: Send + Sync {
    fn stop(&self);
}

pub struct MissingMediaProvider;

#[async_trait]
impl MediaProvider for MissingMediaProvider {
    async fn capture_microphone(&self) -> Result<Arc<dyn MediaHandle>> {
        Err(anyhow!("media provider is unavailable"))
    }
}

/// Factory for peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create_session(&self, media: Arc<dyn MediaHandle>) -> Result<Arc<dyn PeerSession>>;
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn create_session(&self, _media: Arc<dyn MediaHandle>) -> Result<Arc<dyn PeerSession>> {
        Err(anyhow!("peer connector is unavailable"))
    }
}

/// A single peer connection's negotiation surface.
#[async_trait]
pub trait PeerSession: Send + Sync {
    async fn create_offer(&self) -> Result<String>;
    async fn create_answer(&self) -> Result<String>;
    async fn set_remote_description(&self, sdp: &str) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<PeerSessionEvent>;
}

#[derive(Debug, Clone)]
pub enum PeerSessionEvent {
    /// A locally gathered candidate that must be relayed to the peer.
    LocalCandidate(String),
    ConnectionEstablished,
    ConnectionLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

/// Coarse call phase, for consumers that only render transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    Calling,
    RingingIncoming,
    Connected,
}

/// An offer we have received but not yet answered. No media or session
/// exists in this phase; candidates pile up until the user decides.
pub struct IncomingOffer {
    pub from_id: UserId,
    pub from_name: String,
    pub sdp: String,
    pending_ice: Vec<String>,
}

/// Where the remote description stands. Candidates are only delivered to
/// the session once it is `Set`; `Applying` covers the await window of
/// `set_remote_description`, during which candidates must still queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemoteSdp {
    Absent,
    Applying,
    Set,
}

/// Live negotiation state shared by the dialing and connected phases.
pub struct CallSetup {
    peer_id: UserId,
    role: CallRole,
    session: Arc<dyn PeerSession>,
    media: Arc<dyn MediaHandle>,
    event_task: JoinHandle<()>,
    remote: RemoteSdp,
    pending_ice: Vec<String>,
}

#[derive(Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling(CallSetup),
    RingingIncoming(IncomingOffer),
    Connected(CallSetup),
}

impl CallState {
    pub fn is_idle(&self) -> bool {
        matches!(self, CallState::Idle)
    }

    pub fn phase(&self) -> CallPhase {
        match self {
            CallState::Idle => CallPhase::Idle,
            CallState::Calling(_) => CallPhase::Calling,
            CallState::RingingIncoming(_) => CallPhase::RingingIncoming,
            CallState::Connected(_) => CallPhase::Connected,
        }
    }

    pub fn peer_id(&self) -> Option<&UserId> {
        match self {
            CallState::Idle => None,
            CallState::Calling(setup) | CallState::Connected(setup) => Some(&setup.peer_id),
            CallState::RingingIncoming(offer) => Some(&offer.from_id),
        }
    }
}

impl Messenger {
    /// Dial the active conversation's peer. Only allowed when the active
    /// conversation is a direct one, its peer is online, and no other call
    /// is in flight.
    pub async fn start_call(self: &Arc<Self>) -> Result<(), EngineError> {
        let (peer_id, from_id, from_name) = {
            let inner = self.inner.lock().await;
            let profile = inner.profile.as_ref().ok_or(EngineError::NoIdentity)?;
            let active = inner
                .active
                .as_ref()
                .ok_or(EngineError::NoActiveConversation)?;
            if active.contact.kind != ContactKind::Person {
                return Err(EngineError::NotADirectConversation);
            }
            let peer = UserId::new(active.contact.id.clone());
            if !inner.presence.is_online(&peer) {
                return Err(EngineError::PeerOffline);
            }
            if !inner.call.is_idle() {
                return Err(EngineError::CallBusy);
            }
            (peer, profile.id.clone(), profile.name.clone())
        };

        let media = self
            .media
            .capture_microphone()
            .await
            .map_err(|e| EngineError::Media(e.to_string()))?;
        let session = match self.connector.create_session(Arc::clone(&media)).await {
            Ok(session) => session,
            Err(error) => {
                media.stop();
                return Err(EngineError::Media(error.to_string()));
            }
        };
        let sdp = match session.create_offer().await {
            Ok(sdp) => sdp,
            Err(error) => {
                media.stop();
                session.close().await;
                return Err(EngineError::Media(error.to_string()));
            }
        };

        {
            let mut inner = self.inner.lock().await;
            // Someone may have called us while we were setting up.
            if !inner.call.is_idle() {
                drop(inner);
                media.stop();
                session.close().await;
                return Err(EngineError::CallBusy);
            }
            let event_task =
                self.spawn_session_event_task(peer_id.clone(), session.subscribe_events());
            inner.call = CallState::Calling(CallSetup {
                peer_id: peer_id.clone(),
                role: CallRole::Caller,
                session,
                media,
                event_task,
                remote: RemoteSdp::Absent,
                pending_ice: Vec::new(),
            });
        }

        if let Err(error) = self
            .send(ClientEvent::CallOffer {
                to_id: peer_id,
                from_id,
                from_name,
                sdp,
            })
            .await
        {
            self.end_local_call(false).await;
            return Err(error);
        }
        self.notify_call_state().await;
        Ok(())
    }

    /// Accept the ringing offer: bring up media and a session, apply the
    /// stored remote description, drain whatever ICE queued while ringing,
    /// then send our answer back through the relay.
    ///
    /// The ring stays in place while media and the session come up, so
    /// candidates arriving mid-accept keep queueing on it instead of being
    /// dropped; the queue is taken in the same critical section that
    /// installs the live call.
    pub async fn answer_call(self: &Arc<Self>) -> Result<(), EngineError> {
        let (peer_id, remote_sdp, from_id) = {
            let inner = self.inner.lock().await;
            let profile = inner.profile.as_ref().ok_or(EngineError::NoIdentity)?;
            match &inner.call {
                CallState::RingingIncoming(offer) => {
                    (offer.from_id.clone(), offer.sdp.clone(), profile.id.clone())
                }
                _ => return Err(EngineError::NoIncomingCall),
            }
        };

        let (session, media, sdp) = match self.negotiate_answer(&remote_sdp).await {
            Ok(parts) => parts,
            Err(error) => {
                // The caller is still dialing; refuse so their state resets
                // instead of hanging until a timeout.
                let still_ringing = {
                    let mut inner = self.inner.lock().await;
                    match &inner.call {
                        CallState::RingingIncoming(offer) if offer.from_id == peer_id => {
                            inner.call = CallState::Idle;
                            true
                        }
                        _ => false,
                    }
                };
                if still_ringing {
                    let _ = self
                        .send(ClientEvent::CallDecline {
                            to_id: peer_id,
                            from_id,
                        })
                        .await;
                    self.notify_call_state().await;
                }
                return Err(error);
            }
        };

        let queued = {
            let mut inner = self.inner.lock().await;
            match mem::take(&mut inner.call) {
                CallState::RingingIncoming(offer) if offer.from_id == peer_id => {
                    let event_task = self
                        .spawn_session_event_task(peer_id.clone(), session.subscribe_events());
                    inner.call = CallState::Calling(CallSetup {
                        peer_id: peer_id.clone(),
                        role: CallRole::Callee,
                        session: Arc::clone(&session),
                        media,
                        event_task,
                        remote: RemoteSdp::Set,
                        pending_ice: Vec::new(),
                    });
                    offer.pending_ice
                }
                other => {
                    // The ring vanished while we were negotiating.
                    inner.call = other;
                    drop(inner);
                    media.stop();
                    session.close().await;
                    return Err(EngineError::NoIncomingCall);
                }
            }
        };
        for candidate in queued {
            if let Err(error) = session.add_ice_candidate(&candidate).await {
                warn!(%error, "skipping undeliverable ice candidate");
            }
        }

        if let Err(error) = self
            .send(ClientEvent::CallAnswer {
                to_id: peer_id,
                from_id,
                sdp,
            })
            .await
        {
            self.end_local_call(false).await;
            return Err(error);
        }
        self.notify_call_state().await;
        Ok(())
    }

    async fn negotiate_answer(
        &self,
        remote_sdp: &str,
    ) -> Result<(Arc<dyn PeerSession>, Arc<dyn MediaHandle>, String), EngineError> {
        let media = self
            .media
            .capture_microphone()
            .await
            .map_err(|e| EngineError::Media(e.to_string()))?;
        let session = match self.connector.create_session(Arc::clone(&media)).await {
            Ok(session) => session,
            Err(error) => {
                media.stop();
                return Err(EngineError::Media(error.to_string()));
            }
        };

        let negotiated: Result<String> = async {
            session.set_remote_description(remote_sdp).await?;
            session.create_answer().await
        }
        .await;

        match negotiated {
            Ok(sdp) => Ok((session, media, sdp)),
            Err(error) => {
                media.stop();
                session.close().await;
                Err(EngineError::Media(error.to_string()))
            }
        }
    }

    /// Refuse the ringing offer without touching media.
    pub async fn decline_call(&self) -> Result<(), EngineError> {
        let (to_id, from_id) = {
            let mut inner = self.inner.lock().await;
            let profile = inner.profile.as_ref().ok_or(EngineError::NoIdentity)?;
            let from_id = profile.id.clone();
            match mem::take(&mut inner.call) {
                CallState::RingingIncoming(offer) => (offer.from_id, from_id),
                other => {
                    inner.call = other;
                    return Err(EngineError::NoIncomingCall);
                }
            }
        };
        let _ = self
            .send(ClientEvent::CallDecline { to_id, from_id })
            .await;
        self.notify_call_state().await;
        Ok(())
    }

    /// Hang up. A no-op when no call is in flight, so double-clicks and
    /// remote-hangup races are harmless.
    pub async fn end_call(&self) -> Result<(), EngineError> {
        self.end_local_call(true).await;
        Ok(())
    }

    pub(crate) async fn end_local_call(&self, notify_remote: bool) {
        self.teardown_call(None, notify_remote).await;
    }

    async fn teardown_call(&self, only_peer: Option<&UserId>, notify_remote: bool) {
        let torn = {
            let mut inner = self.inner.lock().await;
            let matches = match (inner.call.peer_id(), only_peer) {
                (None, _) => false,
                (Some(current), Some(expected)) => current == expected,
                (Some(_), None) => true,
            };
            if !matches {
                return;
            }
            let state = mem::take(&mut inner.call);
            match state {
                CallState::Idle => return,
                CallState::RingingIncoming(offer) => Some((offer.from_id, None)),
                CallState::Calling(setup) | CallState::Connected(setup) => {
                    Some((setup.peer_id.clone(), Some(setup)))
                }
            }
        };
        let Some((peer_id, setup)) = torn else { return };
        let was_live = setup.is_some();

        let event_task = if let Some(setup) = setup {
            setup.media.stop();
            setup.session.close().await;
            Some(setup.event_task)
        } else {
            None
        };

        if notify_remote {
            if let Some(from_id) = self.profile_id().await {
                // An unanswered ring is refused, not hung up.
                let event = if was_live {
                    ClientEvent::CallEnd {
                        to_id: peer_id,
                        from_id,
                    }
                } else {
                    ClientEvent::CallDecline {
                        to_id: peer_id,
                        from_id,
                    }
                };
                let _ = self.send(event).await;
            }
        }
        self.notify_call_state().await;

        // Aborting last: the forwarder task may itself be running this
        // teardown, and abort cancels it at its next await point.
        if let Some(task) = event_task {
            task.abort();
        }
    }

    pub(crate) async fn handle_incoming_call(&self, from_id: UserId, from_name: String, sdp: String) {
        let busy = {
            let mut inner = self.inner.lock().await;
            if inner.call.is_idle() {
                inner.call = CallState::RingingIncoming(IncomingOffer {
                    from_id: from_id.clone(),
                    from_name,
                    sdp,
                    pending_ice: Vec::new(),
                });
                false
            } else {
                true
            }
        };
        if busy {
            // Auto-decline without disturbing the call in flight.
            if let Some(me) = self.profile_id().await {
                let _ = self
                    .send(ClientEvent::CallDecline {
                        to_id: from_id,
                        from_id: me,
                    })
                    .await;
            }
            return;
        }
        self.notify_call_state().await;
    }

    pub(crate) async fn handle_call_answer(&self, from_id: UserId, sdp: String) {
        let session = {
            let mut inner = self.inner.lock().await;
            match &mut inner.call {
                CallState::Calling(setup)
                    if setup.role == CallRole::Caller
                        && setup.peer_id == from_id
                        && setup.remote == RemoteSdp::Absent =>
                {
                    setup.remote = RemoteSdp::Applying;
                    Arc::clone(&setup.session)
                }
                _ => {
                    debug!(%from_id, "ignoring answer with no matching outbound call");
                    return;
                }
            }
        };
        if let Err(error) = session.set_remote_description(&sdp).await {
            warn!(%error, "failed to apply remote answer, ending call");
            self.teardown_call(Some(&from_id), false).await;
            return;
        }
        // Flip and drain in one critical section so candidates that queued
        // while the description was applying come out in arrival order.
        let queued = {
            let mut inner = self.inner.lock().await;
            match &mut inner.call {
                CallState::Calling(setup) if setup.peer_id == from_id => {
                    setup.remote = RemoteSdp::Set;
                    mem::take(&mut setup.pending_ice)
                }
                _ => return,
            }
        };
        for candidate in queued {
            if let Err(error) = session.add_ice_candidate(&candidate).await {
                warn!(%error, "skipping undeliverable ice candidate");
            }
        }
    }

    pub(crate) async fn handle_call_ice(&self, from_id: UserId, candidate: String) {
        let deliver = {
            let mut inner = self.inner.lock().await;
            match &mut inner.call {
                CallState::RingingIncoming(offer) if offer.from_id == from_id => {
                    offer.pending_ice.push(candidate);
                    None
                }
                CallState::Calling(setup) | CallState::Connected(setup)
                    if setup.peer_id == from_id =>
                {
                    if setup.remote == RemoteSdp::Set {
                        Some((Arc::clone(&setup.session), candidate))
                    } else {
                        setup.pending_ice.push(candidate);
                        None
                    }
                }
                _ => {
                    debug!(%from_id, "dropping ice candidate outside a matching call");
                    None
                }
            }
        };
        if let Some((session, candidate)) = deliver {
            if let Err(error) = session.add_ice_candidate(&candidate).await {
                warn!(%error, "skipping undeliverable ice candidate");
            }
        }
    }

    pub(crate) async fn handle_remote_hangup(&self, from_id: UserId) {
        self.teardown_call(Some(&from_id), false).await;
    }

    pub(crate) async fn mark_call_connected(&self, peer_id: &UserId) {
        let changed = {
            let mut inner = self.inner.lock().await;
            match mem::take(&mut inner.call) {
                CallState::Calling(setup) if setup.peer_id == *peer_id => {
                    inner.call = CallState::Connected(setup);
                    true
                }
                other => {
                    inner.call = other;
                    false
                }
            }
        };
        if changed {
            self.notify_call_state().await;
        }
    }

    /// The offer currently ringing, if any.
    pub async fn incoming_call(&self) -> Option<(UserId, String)> {
        let inner = self.inner.lock().await;
        match &inner.call {
            CallState::RingingIncoming(offer) => {
                Some((offer.from_id.clone(), offer.from_name.clone()))
            }
            _ => None,
        }
    }

    pub async fn call_phase(&self) -> CallPhase {
        self.inner.lock().await.call.phase()
    }

    fn spawn_session_event_task(
        self: &Arc<Self>,
        peer_id: UserId,
        mut events: broadcast::Receiver<PeerSessionEvent>,
    ) -> JoinHandle<()> {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    PeerSessionEvent::LocalCandidate(candidate) => {
                        if let Some(from_id) = client.profile_id().await {
                            let _ = client
                                .send(ClientEvent::CallIce {
                                    to_id: peer_id.clone(),
                                    from_id,
                                    candidate,
                                })
                                .await;
                        }
                    }
                    PeerSessionEvent::ConnectionEstablished => {
                        client.mark_call_connected(&peer_id).await;
                    }
                    PeerSessionEvent::ConnectionLost => {
                        client.teardown_call(Some(&peer_id), false).await;
                        break;
                    }
                }
            }
        })
    }

    pub(crate) async fn notify_call_state(&self) {
        let (phase, peer_id) = {
            let inner = self.inner.lock().await;
            (inner.call.phase(), inner.call.peer_id().cloned())
        };
        let _ = self
            .updates
            .send(ClientUpdate::CallStateChanged { phase, peer_id });
    }
}
