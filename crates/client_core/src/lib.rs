//! Headless messaging engine.
//!
//! [`Messenger`] owns the local state (contacts, conversation logs, read
//! watermarks, presence, call state), reconciles events pushed by the relay
//! into it, and emits the user's own actions out through an [`EventSink`].
//! Transport, persistence, media and peer connections all sit behind traits,
//! so the engine runs the same against a live websocket or scripted fakes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use shared::domain::{
    is_valid_user_id, ChatKey, Contact, ContactKind, Group, GroupId, Profile, UserId,
};
use shared::protocol::{ClientEvent, IntroduceRejection, Message, MessageKind, ServerEvent};

pub mod call;
pub mod presence;
pub mod store;
pub mod transport;

pub use call::{
    CallPhase, CallRole, CallState, MediaHandle, MediaProvider, MissingMediaProvider,
    MissingPeerConnector, PeerConnector, PeerSession, PeerSessionEvent,
};
pub use presence::PresenceTracker;
pub use store::ConversationStore;

use store::SLOT_PROFILE;

/// How long to wait for the relay to answer a request/reply exchange.
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound leg of the transport.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: ClientEvent) -> Result<()>;
}

pub struct MissingEventSink;

#[async_trait]
impl EventSink for MissingEventSink {
    async fn send(&self, _event: ClientEvent) -> Result<()> {
        Err(anyhow!("transport is not connected"))
    }
}

/// Whole-value slot persistence for the local cache.
#[async_trait]
pub trait LocalCache: Send + Sync {
    async fn load(&self, slot: &str) -> Result<Option<String>>;
    async fn save(&self, slot: &str, value: &str) -> Result<()>;
}

#[async_trait]
impl LocalCache for storage::Storage {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        self.load_slot(slot).await
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        self.save_slot(slot, value).await
    }
}

/// In-memory-only operation: loads nothing, persists nowhere.
pub struct NullCache;

#[async_trait]
impl LocalCache for NullCache {
    async fn load(&self, _slot: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn save(&self, _slot: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no identity has been provisioned")]
    NoIdentity,
    #[error("no conversation is selected")]
    NoActiveConversation,
    #[error("the active conversation is not a direct one")]
    NotADirectConversation,
    #[error("peer is offline")]
    PeerOffline,
    #[error("another call is already in flight")]
    CallBusy,
    #[error("no incoming call to act on")]
    NoIncomingCall,
    #[error("invalid user id")]
    InvalidUserId,
    #[error("contact already exists")]
    ContactExists,
    #[error("no such user")]
    UnknownUser,
    #[error("no such message")]
    UnknownMessage,
    #[error("no such group")]
    UnknownGroup,
    #[error("identity was rejected: {0:?}")]
    IdentityRejected(IntroduceRejection),
    #[error("timed out waiting for a reply")]
    ReplyTimeout,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("media error: {0}")]
    Media(String),
}

/// Notifications the engine pushes at whatever is rendering it.
#[derive(Debug, Clone)]
pub enum ClientUpdate {
    ConnectionChanged { online: bool },
    ContactsChanged,
    ConversationUpdated { key: ChatKey },
    PresenceChanged,
    CallStateChanged { phase: CallPhase, peer_id: Option<UserId> },
}

pub(crate) struct ActiveConversation {
    pub contact: Contact,
    pub key: ChatKey,
}

#[derive(Default)]
pub(crate) struct Inner {
    pub profile: Option<Profile>,
    pub store: ConversationStore,
    pub presence: PresenceTracker,
    pub active: Option<ActiveConversation>,
    pub call: CallState,
    pending_user_exists: Option<oneshot::Sender<bool>>,
    pending_introduce: Option<oneshot::Sender<std::result::Result<(), IntroduceRejection>>>,
}

pub struct Messenger {
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) cache: Arc<dyn LocalCache>,
    pub(crate) media: Arc<dyn MediaProvider>,
    pub(crate) connector: Arc<dyn PeerConnector>,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) updates: broadcast::Sender<ClientUpdate>,
}

impl Messenger {
    pub fn new(sink: Arc<dyn EventSink>, cache: Arc<dyn LocalCache>) -> Arc<Self> {
        Self::new_with_dependencies(
            sink,
            cache,
            Arc::new(MissingMediaProvider),
            Arc::new(MissingPeerConnector),
        )
    }

    pub fn new_with_dependencies(
        sink: Arc<dyn EventSink>,
        cache: Arc<dyn LocalCache>,
        media: Arc<dyn MediaProvider>,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        let (updates, _) = broadcast::channel(1024);
        Arc::new(Self {
            sink,
            cache,
            media,
            connector,
            inner: Mutex::new(Inner::default()),
            updates,
        })
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<ClientUpdate> {
        self.updates.subscribe()
    }

    /// Rehydrate contacts, groups, logs, watermarks and the saved identity
    /// from the cache. Call once before connecting.
    pub async fn restore_from_cache(&self) {
        let restored = ConversationStore::load(self.cache.as_ref()).await;
        let profile: Option<Profile> = store::read_slot(self.cache.as_ref(), SLOT_PROFILE).await;
        let mut inner = self.inner.lock().await;
        inner.store = restored;
        inner.profile = profile;
    }

    pub async fn profile(&self) -> Option<Profile> {
        self.inner.lock().await.profile.clone()
    }

    pub(crate) async fn profile_id(&self) -> Option<UserId> {
        self.inner.lock().await.profile.as_ref().map(|p| p.id.clone())
    }

    pub(crate) async fn send(&self, event: ClientEvent) -> Result<(), EngineError> {
        self.sink
            .send(event)
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))
    }

    // --- identity --------------------------------------------------------

    /// First-run identity claim. Mints a fresh credential, introduces it to
    /// the relay, and only persists the profile once the relay accepts the
    /// id as unclaimed.
    pub async fn provision_identity(&self, user_id: &str, name: &str) -> Result<(), EngineError> {
        if !is_valid_user_id(user_id) {
            return Err(EngineError::InvalidUserId);
        }
        let profile = Profile {
            id: UserId::from(user_id),
            name: name.to_string(),
            secret: Uuid::new_v4().simple().to_string(),
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.pending_introduce = Some(tx);
        }
        self.send(ClientEvent::Introduce {
            user_id: profile.id.clone(),
            name: profile.name.clone(),
            secret: profile.secret.clone(),
        })
        .await?;

        let verdict = match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(verdict)) => verdict,
            _ => {
                self.inner.lock().await.pending_introduce = None;
                return Err(EngineError::ReplyTimeout);
            }
        };
        match verdict {
            Ok(()) => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.profile = Some(profile.clone());
                }
                store::write_slot(self.cache.as_ref(), SLOT_PROFILE, &profile).await;
                Ok(())
            }
            Err(reason) => Err(EngineError::IdentityRejected(reason)),
        }
    }

    /// Transport callback: a connection (or reconnection) is up. Re-present
    /// the saved identity so the relay can route to this socket again.
    pub async fn handle_connected(&self) {
        if let Some(profile) = self.profile().await {
            if let Err(error) = self
                .send(ClientEvent::Introduce {
                    user_id: profile.id,
                    name: profile.name,
                    secret: profile.secret,
                })
                .await
            {
                warn!(%error, "failed to re-introduce after connect");
            }
        }
        let _ = self.updates.send(ClientUpdate::ConnectionChanged { online: true });
    }

    /// Transport callback: the connection dropped. Presence is meaningless
    /// until the next snapshot.
    pub async fn handle_disconnected(&self) {
        self.inner.lock().await.presence.clear();
        let _ = self.updates.send(ClientUpdate::PresenceChanged);
        let _ = self.updates.send(ClientUpdate::ConnectionChanged { online: false });
    }

    // --- contacts & conversations ---------------------------------------

    /// Ask the relay whether `target_id` exists, and add it to the sidebar
    /// when it does. The relay also queues a reciprocal contact entry for
    /// the target.
    pub async fn add_contact(&self, target_id: &str) -> Result<(), EngineError> {
        if !is_valid_user_id(target_id) {
            return Err(EngineError::InvalidUserId);
        }
        let (source_id, source_name) = {
            let inner = self.inner.lock().await;
            let profile = inner.profile.as_ref().ok_or(EngineError::NoIdentity)?;
            if profile.id.as_str() == target_id {
                return Err(EngineError::InvalidUserId);
            }
            if inner.store.contact_exists(target_id, ContactKind::Person) {
                return Err(EngineError::ContactExists);
            }
            (profile.id.clone(), profile.name.clone())
        };

        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.pending_user_exists = Some(tx);
        }
        self.send(ClientEvent::CheckUserExists {
            target_id: UserId::from(target_id),
            source_id,
            source_name,
        })
        .await?;

        let exists = match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(exists)) => exists,
            _ => {
                self.inner.lock().await.pending_user_exists = None;
                return Err(EngineError::ReplyTimeout);
            }
        };
        if !exists {
            return Err(EngineError::UnknownUser);
        }

        {
            let mut inner = self.inner.lock().await;
            inner.store.add_contact(Contact {
                id: target_id.to_string(),
                name: target_id.to_string(),
                kind: ContactKind::Person,
            });
        }
        self.persist_all().await;
        let _ = self.updates.send(ClientUpdate::ContactsChanged);
        Ok(())
    }

    pub async fn rename_contact(&self, id: &str, kind: ContactKind, new_name: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.store.rename_contact(id, kind, new_name);
        }
        self.persist_all().await;
        let _ = self.updates.send(ClientUpdate::ContactsChanged);
    }

    pub async fn remove_contact(&self, id: &str) {
        {
            let mut inner = self.inner.lock().await;
            inner.store.remove_person(id);
            if inner
                .active
                .as_ref()
                .is_some_and(|a| a.contact.id == id && a.contact.kind == ContactKind::Person)
            {
                inner.active = None;
            }
        }
        self.persist_all().await;
        let _ = self.updates.send(ClientUpdate::ContactsChanged);
    }

    /// Make `contact` the active conversation and advance its read
    /// watermark. Returns the conversation snapshot for rendering.
    pub async fn select_conversation(&self, contact: Contact) -> Result<Vec<Message>, EngineError> {
        let (key, snapshot) = {
            let mut inner = self.inner.lock().await;
            let me = inner
                .profile
                .as_ref()
                .map(|p| p.id.clone())
                .ok_or(EngineError::NoIdentity)?;
            let key = inner.store.contact_key(&contact, &me);
            inner.store.mark_read(&key, now_ms());
            inner.active = Some(ActiveConversation {
                contact,
                key: key.clone(),
            });
            let snapshot = inner.store.conversation(&key).to_vec();
            (key, snapshot)
        };
        self.persist_all().await;
        let _ = self.updates.send(ClientUpdate::ConversationUpdated { key });
        Ok(snapshot)
    }

    /// Sidebar entries, most recently active first.
    pub async fn ordered_contacts(&self) -> Vec<Contact> {
        let mut inner = self.inner.lock().await;
        match inner.profile.as_ref().map(|p| p.id.clone()) {
            Some(me) => inner.store.ordered_contacts(&me),
            None => Vec::new(),
        }
    }

    pub async fn conversation(&self, key: &ChatKey) -> Vec<Message> {
        self.inner.lock().await.store.conversation(key).to_vec()
    }

    pub async fn has_unread(&self, key: &ChatKey) -> bool {
        self.inner.lock().await.store.unread_since(key)
    }

    pub async fn is_online(&self, id: &UserId) -> bool {
        self.inner.lock().await.presence.is_online(id)
    }

    // --- outbound messaging ----------------------------------------------

    /// Compose and send into the active conversation. The message lands in
    /// the local log before the relay sees it; the relay's echo is then
    /// deduplicated by id.
    pub async fn send_message(
        &self,
        text: String,
        attachment: Option<String>,
    ) -> Result<Message, EngineError> {
        let (message, key) = {
            let mut inner = self.inner.lock().await;
            let profile = inner.profile.as_ref().ok_or(EngineError::NoIdentity)?;
            let active = inner
                .active
                .as_ref()
                .ok_or(EngineError::NoActiveConversation)?;
            let kind = match active.contact.kind {
                ContactKind::Person => MessageKind::Direct,
                ContactKind::Group => MessageKind::Group,
            };
            let message = Message {
                message_id: Uuid::new_v4(),
                from_id: profile.id.clone(),
                from_name: profile.name.clone(),
                to_id: active.contact.id.clone(),
                kind,
                text,
                attachment,
                ts: now_ms(),
                deleted: false,
            };
            let key = message.chat_key();
            inner.store.upsert_message(message.clone());
            inner.store.mark_read(&key, message.ts);
            (message, key)
        };
        self.persist_all().await;
        self.send(ClientEvent::SendMessage {
            message: message.clone(),
        })
        .await?;
        let _ = self.updates.send(ClientUpdate::ConversationUpdated { key });
        Ok(message)
    }

    /// Edit applies locally first, then fans out through the relay.
    pub async fn edit_message(
        &self,
        key: &ChatKey,
        message_id: Uuid,
        new_text: &str,
    ) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock().await;
            inner.store.apply_edit(key, message_id, new_text);
        }
        self.persist_all().await;
        self.send(ClientEvent::EditMessage {
            key: key.clone(),
            message_id,
            new_text: new_text.to_string(),
        })
        .await?;
        let _ = self
            .updates
            .send(ClientUpdate::ConversationUpdated { key: key.clone() });
        Ok(())
    }

    pub async fn delete_message(&self, key: &ChatKey, message_id: Uuid) -> Result<(), EngineError> {
        {
            let mut inner = self.inner.lock().await;
            inner.store.apply_delete(key, message_id);
        }
        self.persist_all().await;
        self.send(ClientEvent::DeleteMessage {
            key: key.clone(),
            message_id,
        })
        .await?;
        let _ = self
            .updates
            .send(ClientUpdate::ConversationUpdated { key: key.clone() });
        Ok(())
    }

    /// Forward an existing message to each recipient as a fresh message of
    /// its own, one wire event per recipient, nothing batched. Every copy
    /// gets its own id and timestamp; only the text and attachment carry
    /// over.
    pub async fn forward_message(
        &self,
        key: &ChatKey,
        message_id: Uuid,
        recipients: &[Contact],
    ) -> Result<Vec<Message>, EngineError> {
        let copies = {
            let mut inner = self.inner.lock().await;
            let profile = inner.profile.as_ref().ok_or(EngineError::NoIdentity)?;
            let (from_id, from_name) = (profile.id.clone(), profile.name.clone());
            let source = inner
                .store
                .conversation(key)
                .iter()
                .find(|m| m.message_id == message_id && !m.deleted)
                .cloned()
                .ok_or(EngineError::UnknownMessage)?;
            let copies: Vec<Message> = recipients
                .iter()
                .map(|recipient| Message {
                    message_id: Uuid::new_v4(),
                    from_id: from_id.clone(),
                    from_name: from_name.clone(),
                    to_id: recipient.id.clone(),
                    kind: match recipient.kind {
                        ContactKind::Person => MessageKind::Direct,
                        ContactKind::Group => MessageKind::Group,
                    },
                    text: source.text.clone(),
                    attachment: source.attachment.clone(),
                    ts: now_ms(),
                    deleted: false,
                })
                .collect();
            for copy in &copies {
                inner.store.upsert_message(copy.clone());
            }
            copies
        };
        self.persist_all().await;
        for copy in &copies {
            self.send(ClientEvent::SendMessage {
                message: copy.clone(),
            })
            .await?;
            let _ = self.updates.send(ClientUpdate::ConversationUpdated {
                key: copy.chat_key(),
            });
        }
        Ok(copies)
    }

    // --- groups -----------------------------------------------------------

    /// Create a group with the local user as creator and member. The relay
    /// announces it to every member, including back to us; the local insert
    /// makes it usable immediately.
    pub async fn create_group(
        &self,
        name: &str,
        mut members: Vec<UserId>,
    ) -> Result<Group, EngineError> {
        let creator_id = self.profile_id().await.ok_or(EngineError::NoIdentity)?;
        if !members.contains(&creator_id) {
            members.push(creator_id.clone());
        }
        let group = Group {
            group_id: GroupId::new(format!("g-{}", Uuid::new_v4().simple())),
            name: name.to_string(),
            members,
            creator_id,
        };
        {
            let mut inner = self.inner.lock().await;
            inner.store.add_group(group.clone());
        }
        self.persist_all().await;
        self.send(ClientEvent::CreateGroup {
            group: group.clone(),
        })
        .await?;
        let _ = self.updates.send(ClientUpdate::ContactsChanged);
        Ok(group)
    }

    /// Leave locally (dropping the sidebar entry, noting it in the log) and
    /// tell the relay so remaining members hear about it.
    pub async fn leave_group(&self, group_id: &GroupId) -> Result<(), EngineError> {
        let user_id = self.profile_id().await.ok_or(EngineError::NoIdentity)?;
        let known = {
            let mut inner = self.inner.lock().await;
            let known = inner.store.leave_group(group_id, &user_id, now_ms());
            if known
                && inner
                    .active
                    .as_ref()
                    .is_some_and(|a| a.contact.kind == ContactKind::Group && a.contact.id == group_id.as_str())
            {
                inner.active = None;
            }
            known
        };
        if !known {
            return Err(EngineError::UnknownGroup);
        }
        self.persist_all().await;
        self.send(ClientEvent::GroupLeave {
            group_id: group_id.clone(),
            user_id,
        })
        .await?;
        let _ = self.updates.send(ClientUpdate::ContactsChanged);
        Ok(())
    }

    // --- inbound reconciliation -------------------------------------------

    /// Fold one relay event into local state. Redeliveries and self-echoes
    /// are absorbed here rather than guarded against at every call site.
    pub async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::IntroduceResult { ok, reason } => {
                let waiter = {
                    let mut inner = self.inner.lock().await;
                    inner.pending_introduce.take()
                };
                match waiter {
                    Some(tx) => {
                        let verdict = if ok {
                            Ok(())
                        } else {
                            Err(reason.unwrap_or(IntroduceRejection::Exists))
                        };
                        let _ = tx.send(verdict);
                    }
                    None if !ok => {
                        warn!(?reason, "relay rejected our standing identity");
                    }
                    None => {}
                }
            }
            ServerEvent::UserExistsResult { exists } => {
                let waiter = {
                    let mut inner = self.inner.lock().await;
                    inner.pending_user_exists.take()
                };
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(exists);
                    }
                    None => debug!("discarding unsolicited user-exists result"),
                }
            }
            ServerEvent::Message { message } => self.ingest_message(message).await,
            ServerEvent::MessageEdited {
                key,
                message_id,
                new_text,
            } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.store.apply_edit(&key, message_id, &new_text);
                }
                self.persist_all().await;
                let _ = self.updates.send(ClientUpdate::ConversationUpdated { key });
            }
            ServerEvent::MessageDeleted { key, message_id } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.store.apply_delete(&key, message_id);
                }
                self.persist_all().await;
                let _ = self.updates.send(ClientUpdate::ConversationUpdated { key });
            }
            ServerEvent::GroupCreated { group } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.store.add_group(group);
                }
                self.persist_all().await;
                let _ = self.updates.send(ClientUpdate::ContactsChanged);
            }
            ServerEvent::ContactAdded { contact } => {
                let added = {
                    let mut inner = self.inner.lock().await;
                    inner.store.add_contact(contact)
                };
                if added {
                    self.persist_all().await;
                    let _ = self.updates.send(ClientUpdate::ContactsChanged);
                }
            }
            ServerEvent::PresenceInit { online } => {
                {
                    let mut inner = self.inner.lock().await;
                    inner.presence.reset(online);
                }
                let _ = self.updates.send(ClientUpdate::PresenceChanged);
            }
            ServerEvent::PresenceUpdate { id, online } => {
                let changed = {
                    let mut inner = self.inner.lock().await;
                    inner.presence.apply(id, online)
                };
                if changed {
                    let _ = self.updates.send(ClientUpdate::PresenceChanged);
                }
            }
            ServerEvent::IncomingCall {
                from_id,
                from_name,
                sdp,
            } => self.handle_incoming_call(from_id, from_name, sdp).await,
            ServerEvent::CallAnswer { from_id, sdp } => {
                self.handle_call_answer(from_id, sdp).await
            }
            ServerEvent::CallIce { from_id, candidate } => {
                self.handle_call_ice(from_id, candidate).await
            }
            ServerEvent::CallEnd { from_id } | ServerEvent::CallDecline { from_id } => {
                self.handle_remote_hangup(from_id).await
            }
        }
    }

    async fn ingest_message(&self, message: Message) {
        let key = message.chat_key();
        let (inserted, contact_added, presence_changed) = {
            let mut inner = self.inner.lock().await;
            let me = inner.profile.as_ref().map(|p| p.id.clone());
            let from_peer = me.as_ref() != Some(&message.from_id);
            // A first direct message from a stranger introduces them.
            let contact_added = if message.kind == MessageKind::Direct && from_peer {
                inner.store.add_contact(Contact {
                    id: message.from_id.as_str().to_string(),
                    name: message.from_name.clone(),
                    kind: ContactKind::Person,
                })
            } else {
                false
            };
            // A message reaching us proves its sender is connected, even if
            // no presence update has said so yet.
            let presence_changed =
                from_peer && inner.presence.apply(message.from_id.clone(), true);
            let inserted = inner.store.upsert_message(message);
            if inserted && inner.active.as_ref().is_some_and(|a| a.key == key) {
                // Reading it live keeps the watermark current.
                inner.store.mark_read(&key, now_ms());
            }
            (inserted, contact_added, presence_changed)
        };
        if inserted || contact_added {
            self.persist_all().await;
        }
        if contact_added {
            let _ = self.updates.send(ClientUpdate::ContactsChanged);
        }
        if presence_changed {
            let _ = self.updates.send(ClientUpdate::PresenceChanged);
        }
        if inserted {
            let _ = self.updates.send(ClientUpdate::ConversationUpdated { key });
        }
    }

    /// Best-effort flush of every cache slot; failures are logged inside the
    /// slot writers and never surface to callers.
    pub(crate) async fn persist_all(&self) {
        let inner = self.inner.lock().await;
        inner.store.persist(self.cache.as_ref()).await;
        if let Some(profile) = &inner.profile {
            store::write_slot(self.cache.as_ref(), SLOT_PROFILE, profile).await;
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod call_tests;
