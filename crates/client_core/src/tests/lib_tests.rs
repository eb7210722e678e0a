use super::*;

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

pub(crate) struct RecordingSink {
    sent: StdMutex<Vec<ClientEvent>>,
}

impl RecordingSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: StdMutex::new(Vec::new()),
        })
    }

    pub(crate) fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, event: ClientEvent) -> Result<()> {
        self.sent.lock().unwrap().push(event);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryCache {
    slots: StdMutex<HashMap<String, String>>,
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn load(&self, slot: &str) -> Result<Option<String>> {
        Ok(self.slots.lock().unwrap().get(slot).cloned())
    }

    async fn save(&self, slot: &str, value: &str) -> Result<()> {
        self.slots
            .lock()
            .unwrap()
            .insert(slot.to_string(), value.to_string());
        Ok(())
    }
}

pub(crate) async fn seed_profile(client: &Messenger, id: &str, name: &str) {
    client.inner.lock().await.profile = Some(Profile {
        id: UserId::from(id),
        name: name.to_string(),
        secret: "seeded-secret".to_string(),
    });
}

pub(crate) fn person(id: &str) -> Contact {
    Contact {
        id: id.to_string(),
        name: id.to_string(),
        kind: ContactKind::Person,
    }
}

pub(crate) fn direct_message(from: &str, to: &str, text: &str, ts: i64) -> Message {
    Message {
        message_id: Uuid::new_v4(),
        from_id: UserId::from(from),
        from_name: from.to_string(),
        to_id: to.to_string(),
        kind: MessageKind::Direct,
        text: text.to_string(),
        attachment: None,
        ts,
        deleted: false,
    }
}

async fn provisioned(sink: Arc<RecordingSink>) -> Arc<Messenger> {
    let client = Messenger::new(sink, Arc::new(NullCache));
    seed_profile(&client, "alice", "Alice").await;
    client
}

async fn with_active_bob(sink: Arc<RecordingSink>) -> Arc<Messenger> {
    let client = provisioned(sink).await;
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("bob"));
    }
    client.select_conversation(person("bob")).await.unwrap();
    client
}

async fn wait_for(sink: &RecordingSink, pred: impl Fn(&[ClientEvent]) -> bool) {
    for _ in 0..200 {
        if pred(&sink.sent()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected outbound event never showed up: {:?}", sink.sent());
}

#[tokio::test]
async fn send_message_is_optimistic_and_echo_deduplicates() {
    let sink = RecordingSink::new();
    let client = with_active_bob(Arc::clone(&sink)).await;

    let message = client.send_message("hi bob".into(), None).await.unwrap();
    let key = message.chat_key();

    // Local log already has it, and the relay saw it.
    assert_eq!(client.conversation(&key).await.len(), 1);
    assert!(matches!(
        sink.sent().last(),
        Some(ClientEvent::SendMessage { .. })
    ));

    // The relay echoes direct messages back to the sender's socket.
    client
        .handle_server_event(ServerEvent::Message {
            message: message.clone(),
        })
        .await;
    assert_eq!(client.conversation(&key).await.len(), 1);
}

#[tokio::test]
async fn edit_rewrites_text_and_tags_it() {
    let sink = RecordingSink::new();
    let client = with_active_bob(Arc::clone(&sink)).await;
    let message = client.send_message("helo".into(), None).await.unwrap();
    let key = message.chat_key();

    client
        .edit_message(&key, message.message_id, "hello")
        .await
        .unwrap();

    let log = client.conversation(&key).await;
    assert_eq!(log[0].text, "hello (edited)");
    assert!(matches!(
        sink.sent().last(),
        Some(ClientEvent::EditMessage { .. })
    ));
}

#[tokio::test]
async fn delete_leaves_a_placeholder_and_blocks_later_edits() {
    let sink = RecordingSink::new();
    let client = with_active_bob(Arc::clone(&sink)).await;
    let message = client
        .send_message("oops".into(), Some("data:image/png;base64,xx".into()))
        .await
        .unwrap();
    let key = message.chat_key();

    client
        .delete_message(&key, message.message_id)
        .await
        .unwrap();
    let log = client.conversation(&key).await;
    assert_eq!(log[0].text, store::DELETED_PLACEHOLDER);
    assert!(log[0].deleted);
    assert!(log[0].attachment.is_none());

    // An edit racing in after the delete changes nothing.
    client
        .handle_server_event(ServerEvent::MessageEdited {
            key: key.clone(),
            message_id: message.message_id,
            new_text: "resurrected".into(),
        })
        .await;
    assert_eq!(client.conversation(&key).await[0].text, store::DELETED_PLACEHOLDER);
}

#[tokio::test]
async fn edits_for_unknown_ids_are_silent_noops() {
    let sink = RecordingSink::new();
    let client = with_active_bob(Arc::clone(&sink)).await;
    let key = ChatKey::direct(&UserId::from("alice"), &UserId::from("bob"));

    client
        .handle_server_event(ServerEvent::MessageEdited {
            key: key.clone(),
            message_id: Uuid::new_v4(),
            new_text: "ghost".into(),
        })
        .await;
    client
        .handle_server_event(ServerEvent::MessageDeleted {
            key: key.clone(),
            message_id: Uuid::new_v4(),
        })
        .await;
    assert!(client.conversation(&key).await.is_empty());
}

#[tokio::test]
async fn logs_preserve_arrival_order_not_timestamp_order() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;
    let key = ChatKey::direct(&UserId::from("alice"), &UserId::from("bob"));

    // A peer with a skewed clock delivers a "newer" message first.
    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("bob", "alice", "first to arrive", 5_000),
        })
        .await;
    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("bob", "alice", "second to arrive", 3_000),
        })
        .await;

    let log = client.conversation(&key).await;
    assert_eq!(log[0].text, "first to arrive");
    assert_eq!(log[1].text, "second to arrive");
}

#[tokio::test]
async fn forwarding_mints_one_fresh_message_per_recipient() {
    let sink = RecordingSink::new();
    let client = with_active_bob(Arc::clone(&sink)).await;
    let original = client.send_message("pass it on".into(), None).await.unwrap();
    let key = original.chat_key();
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("carol"));
        inner.store.add_contact(person("dave"));
    }

    let copies = client
        .forward_message(&key, original.message_id, &[person("carol"), person("dave")])
        .await
        .unwrap();
    assert_eq!(copies.len(), 2);
    for copy in &copies {
        assert_ne!(copy.message_id, original.message_id);
        assert_eq!(copy.text, "pass it on");
        assert_eq!(copy.from_id.as_str(), "alice");
    }
    assert_ne!(copies[0].message_id, copies[1].message_id);
    assert_eq!(copies[0].to_id, "carol");
    assert_eq!(copies[1].to_id, "dave");

    // One wire event per recipient, and each copy is already in its log.
    let sends = sink
        .sent()
        .iter()
        .filter(|e| matches!(e, ClientEvent::SendMessage { .. }))
        .count();
    assert_eq!(sends, 3);
    for copy in &copies {
        assert_eq!(client.conversation(&copy.chat_key()).await.len(), 1);
    }

    // Deleted and unknown sources cannot be forwarded.
    client.delete_message(&key, original.message_id).await.unwrap();
    assert!(matches!(
        client
            .forward_message(&key, original.message_id, &[person("carol")])
            .await,
        Err(EngineError::UnknownMessage)
    ));
}

#[tokio::test]
async fn a_message_from_an_offline_peer_marks_them_online() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("bob"));
    }
    assert!(!client.is_online(&UserId::from("bob")).await);

    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("bob", "alice", "I'm here", 1_000),
        })
        .await;
    assert!(client.is_online(&UserId::from("bob")).await);
}

#[tokio::test]
async fn first_message_from_a_stranger_creates_a_contact() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("mallory", "alice", "hello there", 1_000),
        })
        .await;

    let contacts = client.ordered_contacts().await;
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].id, "mallory");
    assert_eq!(contacts[0].name, "mallory");

    // A second message does not duplicate the entry.
    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("mallory", "alice", "again", 2_000),
        })
        .await;
    assert_eq!(client.ordered_contacts().await.len(), 1);
}

#[tokio::test]
async fn watermarks_track_reading() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("bob"));
    }
    let key = ChatKey::direct(&UserId::from("alice"), &UserId::from("bob"));

    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("bob", "alice", "unseen", now_ms()),
        })
        .await;
    assert!(client.has_unread(&key).await);

    client.select_conversation(person("bob")).await.unwrap();
    assert!(!client.has_unread(&key).await);

    // While the conversation is open, arrivals are read as they land.
    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("bob", "alice", "seen live", now_ms()),
        })
        .await;
    assert!(!client.has_unread(&key).await);
}

#[tokio::test]
async fn sidebar_orders_by_activity_and_keeps_ties_stable() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("bob"));
        inner.store.add_contact(person("carol"));
        inner.store.add_contact(person("dave"));
    }

    let ids = |contacts: Vec<Contact>| contacts.into_iter().map(|c| c.id).collect::<Vec<_>>();

    // No activity yet: insertion order holds.
    assert_eq!(ids(client.ordered_contacts().await), ["bob", "carol", "dave"]);

    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("carol", "alice", "ping", 10_000),
        })
        .await;
    assert_eq!(ids(client.ordered_contacts().await), ["carol", "bob", "dave"]);

    // A tie does not reshuffle the quiet entries.
    client
        .handle_server_event(ServerEvent::Message {
            message: direct_message("bob", "alice", "pong", 10_000),
        })
        .await;
    assert_eq!(ids(client.ordered_contacts().await), ["carol", "bob", "dave"]);
}

#[tokio::test]
async fn presence_snapshot_deltas_and_disconnect() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    client
        .handle_server_event(ServerEvent::PresenceInit {
            online: vec![UserId::from("bob"), UserId::from("carol")],
        })
        .await;
    assert!(client.is_online(&UserId::from("bob")).await);

    client
        .handle_server_event(ServerEvent::PresenceUpdate {
            id: UserId::from("bob"),
            online: false,
        })
        .await;
    assert!(!client.is_online(&UserId::from("bob")).await);
    assert!(client.is_online(&UserId::from("carol")).await);

    client.handle_disconnected().await;
    assert!(!client.is_online(&UserId::from("carol")).await);
}

#[tokio::test]
async fn add_contact_roundtrip() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.add_contact("bob").await }
    });
    wait_for(&sink, |sent| {
        sent.iter()
            .any(|e| matches!(e, ClientEvent::CheckUserExists { .. }))
    })
    .await;
    client
        .handle_server_event(ServerEvent::UserExistsResult { exists: true })
        .await;

    task.await.unwrap().unwrap();
    assert_eq!(client.ordered_contacts().await[0].id, "bob");
}

#[tokio::test]
async fn add_contact_unknown_user() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.add_contact("nobody").await }
    });
    wait_for(&sink, |sent| {
        sent.iter()
            .any(|e| matches!(e, ClientEvent::CheckUserExists { .. }))
    })
    .await;
    client
        .handle_server_event(ServerEvent::UserExistsResult { exists: false })
        .await;

    assert!(matches!(
        task.await.unwrap(),
        Err(EngineError::UnknownUser)
    ));
    assert!(client.ordered_contacts().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn add_contact_times_out_without_a_reply() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;
    let result = client.add_contact("bob").await;
    assert!(matches!(result, Err(EngineError::ReplyTimeout)));
}

#[tokio::test]
async fn add_contact_rejects_bad_targets() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("bob"));
    }

    assert!(matches!(
        client.add_contact("no spaces").await,
        Err(EngineError::InvalidUserId)
    ));
    assert!(matches!(
        client.add_contact("alice").await,
        Err(EngineError::InvalidUserId)
    ));
    assert!(matches!(
        client.add_contact("bob").await,
        Err(EngineError::ContactExists)
    ));
}

#[tokio::test]
async fn provision_identity_persists_only_on_accept() {
    let sink = RecordingSink::new();
    let cache = Arc::new(MemoryCache::default());
    let client = Messenger::new(Arc::clone(&sink) as Arc<dyn EventSink>, Arc::clone(&cache) as Arc<dyn LocalCache>);

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.provision_identity("alice", "Alice").await }
    });
    wait_for(&sink, |sent| {
        sent.iter().any(|e| matches!(e, ClientEvent::Introduce { .. }))
    })
    .await;
    client
        .handle_server_event(ServerEvent::IntroduceResult {
            ok: true,
            reason: None,
        })
        .await;
    task.await.unwrap().unwrap();

    let profile = client.profile().await.unwrap();
    assert_eq!(profile.id.as_str(), "alice");
    assert!(!profile.secret.is_empty());
    assert!(cache.load(store::SLOT_PROFILE).await.unwrap().is_some());
}

#[tokio::test]
async fn provision_identity_taken_id_is_rejected() {
    let sink = RecordingSink::new();
    let cache = Arc::new(MemoryCache::default());
    let client = Messenger::new(Arc::clone(&sink) as Arc<dyn EventSink>, Arc::clone(&cache) as Arc<dyn LocalCache>);

    let task = tokio::spawn({
        let client = Arc::clone(&client);
        async move { client.provision_identity("alice", "Alice").await }
    });
    wait_for(&sink, |sent| {
        sent.iter().any(|e| matches!(e, ClientEvent::Introduce { .. }))
    })
    .await;
    client
        .handle_server_event(ServerEvent::IntroduceResult {
            ok: false,
            reason: Some(IntroduceRejection::Exists),
        })
        .await;

    assert!(matches!(
        task.await.unwrap(),
        Err(EngineError::IdentityRejected(IntroduceRejection::Exists))
    ));
    assert!(client.profile().await.is_none());
    assert!(cache.load(store::SLOT_PROFILE).await.unwrap().is_none());
}

#[tokio::test]
async fn reconnect_reintroduces_the_saved_identity() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    client.handle_connected().await;

    match sink.sent().last() {
        Some(ClientEvent::Introduce { user_id, secret, .. }) => {
            assert_eq!(user_id.as_str(), "alice");
            assert_eq!(secret, "seeded-secret");
        }
        other => panic!("expected an introduce, got {other:?}"),
    }
}

#[tokio::test]
async fn create_and_leave_group() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    let group = client
        .create_group("weekend plans", vec![UserId::from("bob")])
        .await
        .unwrap();
    assert!(group.members.contains(&UserId::from("alice")));
    assert!(group.members.contains(&UserId::from("bob")));
    assert_eq!(client.ordered_contacts().await[0].kind, ContactKind::Group);
    assert!(matches!(
        sink.sent().last(),
        Some(ClientEvent::CreateGroup { .. })
    ));

    let key = ChatKey::group(&group.group_id);
    client.leave_group(&group.group_id).await.unwrap();
    assert!(client.ordered_contacts().await.is_empty());
    let log = client.conversation(&key).await;
    assert_eq!(log.last().unwrap().text, "alice left the group");
    assert!(matches!(
        sink.sent().last(),
        Some(ClientEvent::GroupLeave { .. })
    ));
}

#[tokio::test]
async fn group_announcement_echo_is_idempotent() {
    let sink = RecordingSink::new();
    let client = provisioned(Arc::clone(&sink)).await;

    let group = client
        .create_group("book club", vec![UserId::from("bob")])
        .await
        .unwrap();
    client
        .handle_server_event(ServerEvent::GroupCreated {
            group: group.clone(),
        })
        .await;
    assert_eq!(client.ordered_contacts().await.len(), 1);
}

#[tokio::test]
async fn cache_roundtrip_restores_state() {
    let sink = RecordingSink::new();
    let cache = Arc::new(MemoryCache::default());
    let client = Messenger::new(Arc::clone(&sink) as Arc<dyn EventSink>, Arc::clone(&cache) as Arc<dyn LocalCache>);
    seed_profile(&client, "alice", "Alice").await;
    {
        let mut inner = client.inner.lock().await;
        inner.store.add_contact(person("bob"));
    }
    client.select_conversation(person("bob")).await.unwrap();
    let message = client.send_message("persist me".into(), None).await.unwrap();
    client.persist_all().await;

    let revived = Messenger::new(RecordingSink::new(), Arc::clone(&cache) as Arc<dyn LocalCache>);
    revived.restore_from_cache().await;
    assert_eq!(revived.profile().await.unwrap().id.as_str(), "alice");
    let log = revived.conversation(&message.chat_key()).await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].text, "persist me");
    assert!(!revived.has_unread(&message.chat_key()).await);
}
