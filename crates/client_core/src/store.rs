//! Local cache of contacts, groups, per-conversation message logs and read
//! watermarks. This is the single authority for mutation rules: logs are
//! append-only, edits and deletes mutate in place, and nothing is ever
//! removed from a log once inserted.

use std::collections::HashMap;

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use shared::domain::{ChatKey, Contact, ContactKind, Group, GroupId, UserId};
use shared::protocol::{Message, MessageKind};

use crate::LocalCache;

pub const SLOT_PROFILE: &str = "profile";
pub const SLOT_CONTACTS: &str = "contacts";
pub const SLOT_GROUPS: &str = "groups";
pub const SLOT_MESSAGES: &str = "messages";
pub const SLOT_LAST_READ: &str = "last_read";

pub const DELETED_PLACEHOLDER: &str = "message deleted";
const EDITED_SUFFIX: &str = " (edited)";

#[derive(Debug, Default)]
pub struct ConversationStore {
    contacts: Vec<Contact>,
    groups: HashMap<GroupId, Group>,
    messages: HashMap<ChatKey, Vec<Message>>,
    last_read: HashMap<ChatKey, i64>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    // --- message log -----------------------------------------------------

    /// Idempotent insert: a message whose id is already present in the
    /// conversation is ignored, so transport redelivery and sender self-echo
    /// are both harmless. Returns whether the message was actually appended.
    pub fn upsert_message(&mut self, message: Message) -> bool {
        let log = self.messages.entry(message.chat_key()).or_default();
        if log.iter().any(|m| m.message_id == message.message_id) {
            return false;
        }
        log.push(message);
        true
    }

    /// Replace a message's text, tagging it as edited. Unknown ids are a
    /// silent no-op: the target may simply not have arrived here yet.
    pub fn apply_edit(&mut self, key: &ChatKey, message_id: Uuid, new_text: &str) {
        if let Some(message) = self.find_mut(key, message_id) {
            if message.deleted {
                return;
            }
            message.text = format!("{new_text}{EDITED_SUFFIX}");
        }
    }

    /// Soft-delete: placeholder text, attachment discarded, flag set. The
    /// entry stays in the log. Unknown ids are a silent no-op.
    pub fn apply_delete(&mut self, key: &ChatKey, message_id: Uuid) {
        if let Some(message) = self.find_mut(key, message_id) {
            message.text = DELETED_PLACEHOLDER.to_string();
            message.attachment = None;
            message.deleted = true;
        }
    }

    fn find_mut(&mut self, key: &ChatKey, message_id: Uuid) -> Option<&mut Message> {
        self.messages
            .get_mut(key)?
            .iter_mut()
            .find(|m| m.message_id == message_id)
    }

    pub fn conversation(&self, key: &ChatKey) -> &[Message] {
        self.messages.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Timestamp of the last-arrived message, 0 for an empty conversation.
    pub fn latest_timestamp(&self, key: &ChatKey) -> i64 {
        self.messages
            .get(key)
            .and_then(|log| log.last())
            .map(|m| m.ts)
            .unwrap_or(0)
    }

    // --- read watermarks -------------------------------------------------

    /// Set the watermark to the latest message timestamp, or to `now_ms`
    /// when the conversation is empty.
    pub fn mark_read(&mut self, key: &ChatKey, now_ms: i64) {
        let latest = self.latest_timestamp(key);
        let watermark = if latest > 0 { latest } else { now_ms };
        self.last_read.insert(key.clone(), watermark);
    }

    /// Unread is computed, never stored.
    pub fn unread_since(&self, key: &ChatKey) -> bool {
        self.latest_timestamp(key) > self.last_read.get(key).copied().unwrap_or(0)
    }

    // --- contacts & groups ----------------------------------------------

    /// Insert if `(id, kind)` is not already present. Returns whether the
    /// contact was added.
    pub fn add_contact(&mut self, contact: Contact) -> bool {
        if self.contact_exists(&contact.id, contact.kind) {
            return false;
        }
        self.contacts.push(contact);
        true
    }

    pub fn contact_exists(&self, id: &str, kind: ContactKind) -> bool {
        self.contacts.iter().any(|c| c.id == id && c.kind == kind)
    }

    pub fn rename_contact(&mut self, id: &str, kind: ContactKind, new_name: &str) {
        for contact in &mut self.contacts {
            if contact.id == id && contact.kind == kind {
                contact.name = new_name.to_string();
            }
        }
        if kind == ContactKind::Group {
            if let Some(group) = self.groups.get_mut(&GroupId::new(id)) {
                group.name = new_name.to_string();
            }
        }
    }

    pub fn remove_person(&mut self, id: &str) {
        self.contacts
            .retain(|c| !(c.id == id && c.kind == ContactKind::Person));
    }

    /// Register a group and its sidebar entry. Idempotent union semantics:
    /// a known group id is overwritten, the contact entry is not duplicated.
    pub fn add_group(&mut self, group: Group) {
        self.add_contact(Contact {
            id: group.group_id.as_str().to_string(),
            name: group.name.clone(),
            kind: ContactKind::Group,
        });
        self.groups.insert(group.group_id.clone(), group);
    }

    pub fn group(&self, group_id: &GroupId) -> Option<&Group> {
        self.groups.get(group_id)
    }

    /// Local-only removal of a group, leaving a system note in its log.
    /// Returns whether the group was known.
    pub fn leave_group(&mut self, group_id: &GroupId, leaver: &UserId, now_ms: i64) -> bool {
        if self.groups.remove(group_id).is_none() {
            return false;
        }
        self.contacts
            .retain(|c| !(c.id == group_id.as_str() && c.kind == ContactKind::Group));
        self.upsert_message(Message {
            message_id: Uuid::new_v4(),
            from_id: UserId::from("system"),
            from_name: String::new(),
            to_id: group_id.as_str().to_string(),
            kind: MessageKind::Group,
            text: format!("{leaver} left the group"),
            attachment: None,
            ts: now_ms,
            deleted: false,
        });
        true
    }

    /// Sidebar ordering: descending by latest activity. The stored list is
    /// sorted in place, so conversations that tie (including the
    /// zero-activity ones) keep the order they were last shown in rather
    /// than reverting to insertion order.
    pub fn ordered_contacts(&mut self, me: &UserId) -> Vec<Contact> {
        let messages = &self.messages;
        self.contacts.sort_by_key(|c| {
            let latest = messages
                .get(&contact_key(c, me))
                .and_then(|log| log.last())
                .map(|m| m.ts)
                .unwrap_or(0);
            std::cmp::Reverse(latest)
        });
        self.contacts.clone()
    }

    pub fn contact_key(&self, contact: &Contact, me: &UserId) -> ChatKey {
        contact_key(contact, me)
    }

    // --- cache slots -----------------------------------------------------

    /// Best-effort restore from the five whole-value slots. Corrupt slots
    /// are skipped so one bad blob cannot take the rest of the cache down.
    pub async fn load(cache: &dyn LocalCache) -> Self {
        let mut store = Self::new();
        store.contacts = read_slot(cache, SLOT_CONTACTS).await.unwrap_or_default();
        store.groups = read_slot(cache, SLOT_GROUPS).await.unwrap_or_default();
        store.messages = read_slot(cache, SLOT_MESSAGES).await.unwrap_or_default();
        store.last_read = read_slot(cache, SLOT_LAST_READ).await.unwrap_or_default();
        store
    }

    /// Best-effort persist of every slot; failures are logged and ignored.
    pub async fn persist(&self, cache: &dyn LocalCache) {
        write_slot(cache, SLOT_CONTACTS, &self.contacts).await;
        write_slot(cache, SLOT_GROUPS, &self.groups).await;
        write_slot(cache, SLOT_MESSAGES, &self.messages).await;
        write_slot(cache, SLOT_LAST_READ, &self.last_read).await;
    }
}

fn contact_key(contact: &Contact, me: &UserId) -> ChatKey {
    match contact.kind {
        ContactKind::Group => ChatKey::group(&GroupId::new(contact.id.clone())),
        ContactKind::Person => ChatKey::direct(me, &UserId::new(contact.id.clone())),
    }
}

pub(crate) async fn read_slot<T: serde::de::DeserializeOwned>(
    cache: &dyn LocalCache,
    slot: &str,
) -> Option<T> {
    match cache.load(slot).await {
        Ok(Some(raw)) => match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(error) => {
                warn!(slot, %error, "ignoring corrupt cache slot");
                None
            }
        },
        Ok(None) => None,
        Err(error) => {
            warn!(slot, %error, "failed to read cache slot");
            None
        }
    }
}

pub(crate) async fn write_slot<T: Serialize>(cache: &dyn LocalCache, slot: &str, value: &T) {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(error) => {
            warn!(slot, %error, "failed to serialize cache slot");
            return;
        }
    };
    if let Err(error) = cache.save(slot, &raw).await {
        warn!(slot, %error, "failed to persist cache slot");
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
