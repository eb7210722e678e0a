//! Relay state machine: identity arbitration, presence, message fan-out and
//! call-signal forwarding. Sockets are reduced to per-user event senders so
//! the whole thing can be exercised without a network.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::domain::{is_valid_user_id, Contact, ContactKind, GroupId, UserId};
use shared::protocol::{ClientEvent, IntroduceRejection, Message, MessageKind, ServerEvent};
use storage::{IdentityClaim, Storage};

pub type ClientSender = mpsc::UnboundedSender<ServerEvent>;

pub struct Relay {
    storage: Storage,
    online: Mutex<HashMap<UserId, ClientSender>>,
}

impl Relay {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            online: Mutex::new(HashMap::new()),
        }
    }

    /// Arbitrate an identity claim for a freshly connected socket.
    ///
    /// An accepted claim registers the socket (displacing any stale one for
    /// the same user), replies with the verdict and a presence snapshot, and
    /// flushes contact requests queued while the user was away. Returns the
    /// registered id, or `None` when the claim was refused.
    pub async fn introduce(
        &self,
        tx: &ClientSender,
        user_id: UserId,
        name: String,
        secret: String,
    ) -> Result<Option<UserId>> {
        if !is_valid_user_id(user_id.as_str()) {
            let _ = tx.send(ServerEvent::IntroduceResult {
                ok: false,
                reason: Some(IntroduceRejection::InvalidId),
            });
            return Ok(None);
        }

        match self.storage.claim_identity(&user_id, &name, &secret).await? {
            IdentityClaim::Taken => {
                info!(%user_id, "refusing claim on a taken id");
                let _ = tx.send(ServerEvent::IntroduceResult {
                    ok: false,
                    reason: Some(IntroduceRejection::Exists),
                });
                Ok(None)
            }
            IdentityClaim::Accepted => {
                let (already_online, snapshot) = {
                    let mut online = self.online.lock().await;
                    let replaced = online.insert(user_id.clone(), tx.clone()).is_some();
                    (replaced, online.keys().cloned().collect::<Vec<_>>())
                };

                let _ = tx.send(ServerEvent::IntroduceResult {
                    ok: true,
                    reason: None,
                });
                let _ = tx.send(ServerEvent::PresenceInit { online: snapshot });
                if !already_online {
                    self.broadcast_presence(&user_id, true).await;
                }
                for contact in self.storage.drain_pending_contacts(&user_id).await? {
                    let _ = tx.send(ServerEvent::ContactAdded { contact });
                }
                info!(%user_id, "user online");
                Ok(Some(user_id))
            }
        }
    }

    /// Unregister a socket, unless the user already reconnected elsewhere.
    pub async fn disconnect(&self, user_id: &UserId, tx: &ClientSender) {
        let removed = {
            let mut online = self.online.lock().await;
            match online.get(user_id) {
                Some(current) if current.same_channel(tx) => {
                    online.remove(user_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Err(error) = self.storage.touch_last_seen(user_id, Utc::now()).await {
                warn!(%user_id, %error, "failed to record last-seen time");
            }
            self.broadcast_presence(user_id, false).await;
            info!(%user_id, "user offline");
        }
    }

    /// Process one event from an introduced user.
    pub async fn handle(&self, from: &UserId, event: ClientEvent) -> Result<()> {
        match event {
            ClientEvent::Introduce { .. } => {
                debug!(%from, "ignoring repeated introduce on a live session");
            }
            ClientEvent::CheckUserExists {
                target_id,
                source_id,
                source_name,
            } => {
                let exists = self.storage.user_exists(&target_id).await?;
                self.send_to(from, ServerEvent::UserExistsResult { exists })
                    .await;
                if exists && target_id != *from {
                    // Reciprocal entry for the target, now or on next login.
                    let contact = Contact {
                        id: source_id.as_str().to_string(),
                        name: source_name,
                        kind: ContactKind::Person,
                    };
                    let delivered = self
                        .send_to(
                            &target_id,
                            ServerEvent::ContactAdded {
                                contact: contact.clone(),
                            },
                        )
                        .await;
                    if !delivered {
                        self.storage
                            .queue_pending_contact(&target_id, &contact)
                            .await?;
                    }
                }
            }
            ClientEvent::SendMessage { message } => {
                if message.from_id != *from {
                    warn!(%from, claimed = %message.from_id, "dropping spoofed message");
                    return Ok(());
                }
                self.storage.append_message(&message).await?;
                match message.kind {
                    MessageKind::Direct => {
                        let to = UserId::new(message.to_id.clone());
                        self.send_to(
                            &to,
                            ServerEvent::Message {
                                message: message.clone(),
                            },
                        )
                        .await;
                        // Echo the archived copy back to the sender's socket.
                        self.send_to(from, ServerEvent::Message { message }).await;
                    }
                    MessageKind::Group => {
                        let group_id = GroupId::new(message.to_id.clone());
                        if let Some(group) = self.storage.load_group(&group_id).await? {
                            self.fan_out(&group.members, ServerEvent::Message { message })
                                .await;
                        } else {
                            debug!(%group_id, "dropping message for unknown group");
                        }
                    }
                }
            }
            ClientEvent::EditMessage {
                key,
                message_id,
                new_text,
            } => {
                if self.storage.edit_message(message_id, &new_text).await? {
                    let recipients = self.message_participants(message_id).await?;
                    self.fan_out(
                        &recipients,
                        ServerEvent::MessageEdited {
                            key,
                            message_id,
                            new_text,
                        },
                    )
                    .await;
                }
            }
            ClientEvent::DeleteMessage { key, message_id } => {
                if self.storage.delete_message(message_id).await? {
                    let recipients = self.message_participants(message_id).await?;
                    self.fan_out(&recipients, ServerEvent::MessageDeleted { key, message_id })
                        .await;
                }
            }
            ClientEvent::CreateGroup { group } => {
                if group.creator_id != *from {
                    warn!(%from, "dropping group created on someone else's behalf");
                    return Ok(());
                }
                self.storage.upsert_group(&group).await?;
                let members = group.members.clone();
                self.fan_out(&members, ServerEvent::GroupCreated { group })
                    .await;
            }
            ClientEvent::GroupLeave { group_id, user_id } => {
                if user_id != *from {
                    warn!(%from, "dropping leave for a different user");
                    return Ok(());
                }
                if self.storage.remove_group_member(&group_id, &user_id).await? {
                    let note = Message {
                        message_id: Uuid::new_v4(),
                        from_id: UserId::from("system"),
                        from_name: String::new(),
                        to_id: group_id.as_str().to_string(),
                        kind: MessageKind::Group,
                        text: format!("{user_id} left the group"),
                        attachment: None,
                        ts: Utc::now().timestamp_millis(),
                        deleted: false,
                    };
                    self.storage.append_message(&note).await?;
                    if let Some(group) = self.storage.load_group(&group_id).await? {
                        self.fan_out(&group.members, ServerEvent::Message { message: note })
                            .await;
                    }
                }
            }
            ClientEvent::CallOffer {
                to_id,
                from_id,
                from_name,
                sdp,
            } => {
                if from_id != *from {
                    return Ok(());
                }
                let delivered = self
                    .send_to(
                        &to_id,
                        ServerEvent::IncomingCall {
                            from_id,
                            from_name,
                            sdp,
                        },
                    )
                    .await;
                if !delivered {
                    // Target vanished between its last presence update and
                    // the dial; bounce so the caller's state resets.
                    self.send_to(from, ServerEvent::CallDecline { from_id: to_id })
                        .await;
                }
            }
            ClientEvent::CallAnswer {
                to_id,
                from_id,
                sdp,
            } => {
                if from_id == *from {
                    self.send_to(&to_id, ServerEvent::CallAnswer { from_id, sdp })
                        .await;
                }
            }
            ClientEvent::CallIce {
                to_id,
                from_id,
                candidate,
            } => {
                if from_id == *from {
                    self.send_to(&to_id, ServerEvent::CallIce { from_id, candidate })
                        .await;
                }
            }
            ClientEvent::CallEnd { to_id, from_id } => {
                if from_id == *from {
                    self.send_to(&to_id, ServerEvent::CallEnd { from_id }).await;
                }
            }
            ClientEvent::CallDecline { to_id, from_id } => {
                if from_id == *from {
                    self.send_to(&to_id, ServerEvent::CallDecline { from_id })
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn broadcast_presence(&self, user_id: &UserId, is_online: bool) {
        let online = self.online.lock().await;
        for (id, tx) in online.iter() {
            if id == user_id {
                continue;
            }
            let _ = tx.send(ServerEvent::PresenceUpdate {
                id: user_id.clone(),
                online: is_online,
            });
        }
    }

    /// Deliver to a single user; `false` when they are offline.
    async fn send_to(&self, user_id: &UserId, event: ServerEvent) -> bool {
        let online = self.online.lock().await;
        match online.get(user_id) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    async fn fan_out(&self, recipients: &[UserId], event: ServerEvent) {
        let online = self.online.lock().await;
        for id in recipients {
            if let Some(tx) = online.get(id) {
                let _ = tx.send(event.clone());
            }
        }
    }

    /// Everyone who should hear about a change to the given message,
    /// resolved from the archived row. Ids may legally contain underscores,
    /// so the direct chat key cannot be split back into its pair.
    async fn message_participants(&self, message_id: Uuid) -> Result<Vec<UserId>> {
        let Some(message) = self.storage.load_message(message_id).await? else {
            return Ok(Vec::new());
        };
        match message.kind {
            MessageKind::Group => Ok(self
                .storage
                .load_group(&GroupId::new(message.to_id))
                .await?
                .map(|g| g.members)
                .unwrap_or_default()),
            MessageKind::Direct => Ok(vec![message.from_id, UserId::new(message.to_id)]),
        }
    }
}
