use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{ChatKey, Contact, Group, GroupId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Direct,
    Group,
}

/// A chat message as it travels over the wire and sits in the local log.
///
/// `message_id` is minted once at creation and is the only correlation key
/// for edits and deletes; `ts` (origin-clock epoch millis) drives ordering,
/// watermarks, and display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: Uuid,
    pub from_id: UserId,
    pub from_name: String,
    pub to_id: String,
    pub kind: MessageKind,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<String>,
    pub ts: i64,
    #[serde(default)]
    pub deleted: bool,
}

impl Message {
    /// Conversation key this message belongs to, from the recipient's or the
    /// sender's perspective alike.
    pub fn chat_key(&self) -> ChatKey {
        match self.kind {
            MessageKind::Group => ChatKey::group(&GroupId::new(self.to_id.clone())),
            MessageKind::Direct => {
                ChatKey::direct(&self.from_id, &UserId::new(self.to_id.clone()))
            }
        }
    }
}

/// Why an introduction was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntroduceRejection {
    Exists,
    InvalidId,
}

/// Events emitted by the client toward the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Introduce {
        user_id: UserId,
        name: String,
        /// Present on first-run provisioning; reconnects resend it so the
        /// server can verify the claim belongs to the same owner.
        secret: String,
    },
    CheckUserExists {
        target_id: UserId,
        source_id: UserId,
        source_name: String,
    },
    SendMessage {
        message: Message,
    },
    EditMessage {
        key: ChatKey,
        message_id: Uuid,
        new_text: String,
    },
    DeleteMessage {
        key: ChatKey,
        message_id: Uuid,
    },
    CreateGroup {
        group: Group,
    },
    GroupLeave {
        group_id: GroupId,
        user_id: UserId,
    },
    CallOffer {
        to_id: UserId,
        from_id: UserId,
        from_name: String,
        sdp: String,
    },
    CallAnswer {
        to_id: UserId,
        from_id: UserId,
        sdp: String,
    },
    CallIce {
        to_id: UserId,
        from_id: UserId,
        candidate: String,
    },
    CallEnd {
        to_id: UserId,
        from_id: UserId,
    },
    CallDecline {
        to_id: UserId,
        from_id: UserId,
    },
}

/// Events pushed by the relay toward clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    IntroduceResult {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<IntroduceRejection>,
    },
    UserExistsResult {
        exists: bool,
    },
    Message {
        message: Message,
    },
    MessageEdited {
        key: ChatKey,
        message_id: Uuid,
        new_text: String,
    },
    MessageDeleted {
        key: ChatKey,
        message_id: Uuid,
    },
    GroupCreated {
        group: Group,
    },
    ContactAdded {
        contact: Contact,
    },
    PresenceInit {
        online: Vec<UserId>,
    },
    PresenceUpdate {
        id: UserId,
        online: bool,
    },
    IncomingCall {
        from_id: UserId,
        from_name: String,
        sdp: String,
    },
    CallAnswer {
        from_id: UserId,
        sdp: String,
    },
    CallIce {
        from_id: UserId,
        candidate: String,
    },
    CallEnd {
        from_id: UserId,
    },
    CallDecline {
        from_id: UserId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ContactKind;

    #[test]
    fn client_event_wire_shape() {
        let event = ClientEvent::Introduce {
            user_id: UserId::from("alice"),
            name: "Alice".into(),
            secret: "s3cr3t".into(),
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&event).unwrap()).unwrap();
        assert_eq!(json["type"], "introduce");
        assert_eq!(json["payload"]["user_id"], "alice");
    }

    #[test]
    fn server_event_roundtrip() {
        let event = ServerEvent::ContactAdded {
            contact: Contact {
                id: "bob".into(),
                name: "Bob".into(),
                kind: ContactKind::Person,
            },
        };
        let text = serde_json::to_string(&event).unwrap();
        let back: ServerEvent = serde_json::from_str(&text).unwrap();
        match back {
            ServerEvent::ContactAdded { contact } => assert_eq!(contact.id, "bob"),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn message_chat_key_matches_both_perspectives() {
        let message = Message {
            message_id: Uuid::new_v4(),
            from_id: UserId::from("bob"),
            from_name: "Bob".into(),
            to_id: "alice".into(),
            kind: MessageKind::Direct,
            text: "hi".into(),
            attachment: None,
            ts: 1_700_000_000_000,
            deleted: false,
        };
        assert_eq!(
            message.chat_key(),
            ChatKey::direct(&UserId::from("alice"), &UserId::from("bob"))
        );
    }

    #[test]
    fn deleted_flag_defaults_to_false() {
        let raw = r#"{
            "message_id": "6dfac11a-22a9-4e3e-9fd1-1e5cb4a2fd55",
            "from_id": "a", "from_name": "A", "to_id": "b",
            "kind": "direct", "text": "x", "ts": 1
        }"#;
        let message: Message = serde_json::from_str(raw).unwrap();
        assert!(!message.deleted);
        assert!(message.attachment.is_none());
    }
}
