use super::*;
use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use shared::domain::ActionToken;
use shared::error::{BackendError, ErrorCode};
use shared::protocol::{
    ActionEvent, ActionOp, ActionRecord, HistoryPage, MessageEnvelope, Occupant, SignalEnvelope,
    StoredMessage,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;

struct TestBackend {
    user_id: UserId,
    fail_publish: bool,
    fail_presence_state: bool,
    fail_subscribe: Option<BackendError>,
    gate_paginated: bool,
    gate: Notify,
    pages: AsyncMutex<VecDeque<HistoryPage>>,
    history_calls: AsyncMutex<Vec<(ChannelId, usize, Option<MessageToken>)>>,
    published: AsyncMutex<Vec<(ChannelId, MessagePayload)>>,
    signals: AsyncMutex<Vec<SignalPayload>>,
    state_broadcasts: AsyncMutex<Vec<PresenceState>>,
    occupants: AsyncMutex<Vec<Occupant>>,
    streams: AsyncMutex<std::collections::HashMap<ChannelId, mpsc::UnboundedSender<BackendEvent>>>,
    removed_actions: AsyncMutex<Vec<(MessageToken, ActionToken)>>,
    next_action_token: AsyncMutex<i64>,
}

impl TestBackend {
    fn new(user: &str) -> Self {
        Self {
            user_id: UserId::new(user),
            fail_publish: false,
            fail_presence_state: false,
            fail_subscribe: None,
            gate_paginated: false,
            gate: Notify::new(),
            pages: AsyncMutex::new(VecDeque::new()),
            history_calls: AsyncMutex::new(Vec::new()),
            published: AsyncMutex::new(Vec::new()),
            signals: AsyncMutex::new(Vec::new()),
            state_broadcasts: AsyncMutex::new(Vec::new()),
            occupants: AsyncMutex::new(Vec::new()),
            streams: AsyncMutex::new(std::collections::HashMap::new()),
            removed_actions: AsyncMutex::new(Vec::new()),
            next_action_token: AsyncMutex::new(0),
        }
    }

    fn failing_publish(user: &str) -> Self {
        let mut backend = Self::new(user);
        backend.fail_publish = true;
        backend
    }

    fn with_pages(self, pages: Vec<HistoryPage>) -> Self {
        *self.pages.try_lock().expect("pages lock") = pages.into();
        self
    }

    fn with_gated_pagination(mut self) -> Self {
        self.gate_paginated = true;
        self
    }

    fn with_failing_subscribe(mut self, err: BackendError) -> Self {
        self.fail_subscribe = Some(err);
        self
    }

    fn with_failing_presence_state(mut self) -> Self {
        self.fail_presence_state = true;
        self
    }

    async fn emit(&self, channel: &ChannelId, event: BackendEvent) {
        let streams = self.streams.lock().await;
        let tx = streams.get(channel).expect("channel subscribed");
        tx.send(event).expect("stream open");
    }

    async fn set_occupants(&self, occupants: Vec<Occupant>) {
        *self.occupants.lock().await = occupants;
    }
}

#[async_trait]
impl backend_api::RealtimeBackend for TestBackend {
    async fn subscribe(
        &self,
        channel: &ChannelId,
        _with_presence: bool,
    ) -> Result<EventStream, BackendError> {
        if let Some(err) = &self.fail_subscribe {
            return Err(err.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().await.insert(channel.clone(), tx);
        let connected = stream::iter([BackendEvent::Status(StatusEvent::Connected)]);
        Ok(Box::pin(connected.chain(UnboundedReceiverStream::new(rx))))
    }

    async fn unsubscribe(&self, channel: &ChannelId) -> Result<(), BackendError> {
        self.streams.lock().await.remove(channel);
        Ok(())
    }

    async fn publish(
        &self,
        channel: &ChannelId,
        payload: MessagePayload,
    ) -> Result<(), BackendError> {
        if self.fail_publish {
            return Err(BackendError::internal("publish rejected"));
        }
        self.published.lock().await.push((channel.clone(), payload));
        Ok(())
    }

    async fn fetch_history(
        &self,
        channel: &ChannelId,
        count: usize,
        before: Option<MessageToken>,
    ) -> Result<HistoryPage, BackendError> {
        self.history_calls
            .lock()
            .await
            .push((channel.clone(), count, before));
        if self.gate_paginated && before.is_some() {
            self.gate.notified().await;
        }
        let page = self
            .pages
            .lock()
            .await
            .pop_front()
            .unwrap_or(HistoryPage { messages: Vec::new() });
        Ok(page)
    }

    async fn presence_snapshot(&self, _channel: &ChannelId) -> Result<Vec<Occupant>, BackendError> {
        Ok(self.occupants.lock().await.clone())
    }

    async fn set_presence_state(
        &self,
        _channel: &ChannelId,
        state: PresenceState,
    ) -> Result<(), BackendError> {
        self.state_broadcasts.lock().await.push(state);
        if self.fail_presence_state {
            return Err(BackendError::new(ErrorCode::NetworkIssues, "flaky"));
        }
        Ok(())
    }

    async fn signal(
        &self,
        _channel: &ChannelId,
        payload: SignalPayload,
    ) -> Result<(), BackendError> {
        self.signals.lock().await.push(payload);
        Ok(())
    }

    async fn add_message_action(
        &self,
        _channel: &ChannelId,
        _message_token: MessageToken,
        _kind: ActionKind,
        _value: &str,
    ) -> Result<ActionToken, BackendError> {
        let mut next = self.next_action_token.lock().await;
        *next += 1;
        Ok(ActionToken(*next))
    }

    async fn remove_message_action(
        &self,
        _channel: &ChannelId,
        message_token: MessageToken,
        action_token: ActionToken,
    ) -> Result<(), BackendError> {
        self.removed_actions
            .lock()
            .await
            .push((message_token, action_token));
        Ok(())
    }

    fn local_user(&self) -> &UserId {
        &self.user_id
    }
}

fn profile(user: &str, name: &str) -> LocalProfile {
    LocalProfile {
        user_id: UserId::new(user),
        name: name.to_string(),
        avatar: None,
        color: None,
    }
}

fn test_config() -> SyncConfig {
    SyncConfig {
        history_page_size: 3,
        presence_poll_interval: Duration::from_millis(40),
        typing_idle_timeout: Duration::from_millis(100),
        read_settle_delay: Duration::from_millis(30),
        presence_state_retry_attempts: 2,
        presence_state_retry_base_delay: Duration::from_millis(10),
        event_buffer: 64,
    }
}

fn stored(token: i64, user: &str, text: &str) -> StoredMessage {
    StoredMessage {
        token: MessageToken(token),
        publisher: UserId::new(user),
        payload: MessagePayload {
            client_message_id: ClientMessageId::generate(),
            sender: SenderProfile {
                user_id: UserId::new(user),
                name: user.to_string(),
                avatar: None,
                color: None,
            },
            text: Some(text.to_string()),
            file: None,
            created_at: Utc::now(),
        },
        actions: Vec::new(),
    }
}

fn page(messages: Vec<StoredMessage>) -> HistoryPage {
    HistoryPage { messages }
}

fn reaction(action_token: i64, message_token: i64, actor: &str, value: &str) -> ActionRecord {
    ActionRecord {
        action_token: ActionToken(action_token),
        message_token: MessageToken(message_token),
        actor: UserId::new(actor),
        kind: ActionKind::Reaction,
        value: value.to_string(),
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(60)).await;
}

fn general() -> ChannelId {
    ChannelId::new("general")
}

#[tokio::test]
async fn activation_loads_initial_history_and_connects() {
    let backend = Arc::new(TestBackend::new("alice").with_pages(vec![page(vec![
        stored(10, "bob", "one"),
        stored(20, "bob", "two"),
        stored(30, "bob", "three"),
    ])]));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());

    engine.activate(general()).await.expect("activate");
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(view.channel_id, Some(general()));
    assert_eq!(view.messages.len(), 3);
    assert!(view.has_more_history);
    assert!(view.connection.is_connected());
    assert!(view
        .messages
        .iter()
        .all(|entry| entry.status == MessageStatus::Confirmed));
}

#[tokio::test]
async fn publish_failure_marks_the_message_failed_without_duplicates() {
    let backend = Arc::new(TestBackend::failing_publish("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    let err = engine
        .send_message("hello", None)
        .await
        .expect_err("publish must fail");
    assert!(matches!(err, SyncError::Publish(_)));

    let view = engine.snapshot().await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].status, MessageStatus::Failed);
    assert_eq!(view.messages[0].text.as_deref(), Some("hello"));

    settle().await;
    let view = engine.snapshot().await;
    assert_eq!(view.messages.len(), 1, "failed entry must stay, once");
}

#[tokio::test]
async fn rapid_identical_sends_stay_distinct() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    engine.send_message("hi", None).await.expect("send");
    engine.send_message("hi", None).await.expect("send");

    let view = engine.snapshot().await;
    assert_eq!(view.messages.len(), 2);
    assert_ne!(
        view.messages[0].client_message_id,
        view.messages[1].client_message_id
    );
    assert!(view.messages[0].token < view.messages[1].token);
    assert_eq!(backend.published.lock().await.len(), 2);
}

#[tokio::test]
async fn confirmed_event_reconciles_the_pending_entry_in_place() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    engine.send_message("hello", None).await.expect("send");
    let payload = backend.published.lock().await[0].1.clone();

    backend
        .emit(
            &general(),
            BackendEvent::Message(MessageEnvelope {
                channel_id: general(),
                token: MessageToken(500),
                publisher: UserId::new("alice"),
                payload: payload.clone(),
            }),
        )
        .await;
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.messages[0].status, MessageStatus::Confirmed);
    assert_eq!(view.messages[0].token, MessageToken(500));

    // at-least-once redelivery of the same confirmation changes nothing
    backend
        .emit(
            &general(),
            BackendEvent::Message(MessageEnvelope {
                channel_id: general(),
                token: MessageToken(500),
                publisher: UserId::new("alice"),
                payload,
            }),
        )
        .await;
    settle().await;
    assert_eq!(engine.snapshot().await.messages.len(), 1);
}

#[tokio::test]
async fn fetch_more_is_a_noop_once_history_is_exhausted() {
    let backend = Arc::new(
        TestBackend::new("alice")
            .with_pages(vec![page(vec![stored(10, "bob", "only"), stored(20, "bob", "last")])]),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    let view = engine.snapshot().await;
    assert!(!view.has_more_history, "short page ends pagination");

    engine.fetch_more_history().await.expect("noop");
    assert_eq!(backend.history_calls.lock().await.len(), 1);
    assert_eq!(engine.snapshot().await.messages.len(), 2);
}

#[tokio::test]
async fn fetch_more_does_not_stack_overlapping_requests() {
    let backend = Arc::new(
        TestBackend::new("alice")
            .with_pages(vec![
                page(vec![
                    stored(40, "bob", "d"),
                    stored(50, "bob", "e"),
                    stored(60, "bob", "f"),
                ]),
                page(vec![
                    stored(10, "bob", "a"),
                    stored(20, "bob", "b"),
                    stored(30, "bob", "c"),
                ]),
            ])
            .with_gated_pagination(),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    let paginating = engine.clone();
    let in_flight = tokio::spawn(async move { paginating.fetch_more_history().await });
    settle().await;
    assert!(engine.snapshot().await.is_paginating);

    // second call is a no-op while the first is in flight
    engine.fetch_more_history().await.expect("noop");
    assert_eq!(backend.history_calls.lock().await.len(), 2);

    backend.gate.notify_one();
    in_flight.await.expect("join").expect("fetch");

    let view = engine.snapshot().await;
    assert!(!view.is_paginating);
    assert_eq!(view.messages.len(), 6);
    let tokens: Vec<i64> = view.messages.iter().map(|m| m.token.0).collect();
    assert_eq!(tokens, vec![10, 20, 30, 40, 50, 60]);
}

#[tokio::test]
async fn stale_history_result_from_previous_channel_is_discarded() {
    let backend = Arc::new(
        TestBackend::new("alice")
            .with_pages(vec![
                page(vec![
                    stored(10, "bob", "a"),
                    stored(20, "bob", "b"),
                    stored(30, "bob", "c"),
                ]),
                page(vec![stored(100, "carol", "b-chat")]),
                page(vec![
                    stored(1, "bob", "ancient"),
                    stored(2, "bob", "older"),
                    stored(3, "bob", "old"),
                ]),
            ])
            .with_gated_pagination(),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());

    engine.activate(ChannelId::new("a")).await.expect("activate a");
    settle().await;

    let paginating = engine.clone();
    let in_flight = tokio::spawn(async move { paginating.fetch_more_history().await });
    settle().await;

    engine.activate(ChannelId::new("b")).await.expect("activate b");
    settle().await;

    backend.gate.notify_one();
    in_flight.await.expect("join").expect("fetch");
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(view.channel_id, Some(ChannelId::new("b")));
    let tokens: Vec<i64> = view.messages.iter().map(|m| m.token.0).collect();
    assert_eq!(tokens, vec![100], "stale page for channel a must not leak");
    assert!(!view.is_paginating);
}

#[tokio::test]
async fn duplicate_reaction_event_applies_once() {
    let backend = Arc::new(
        TestBackend::new("alice").with_pages(vec![page(vec![stored(100, "bob", "hello")])]),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    let event = BackendEvent::Action(ActionEvent {
        channel_id: general(),
        op: ActionOp::Added,
        action: reaction(7, 100, "bob", "❤️"),
    });
    backend.emit(&general(), event.clone()).await;
    backend.emit(&general(), event).await;
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(view.messages[0].reactions.marks("❤️").len(), 1);

    backend
        .emit(
            &general(),
            BackendEvent::Action(ActionEvent {
                channel_id: general(),
                op: ActionOp::Removed,
                action: reaction(7, 100, "bob", "❤️"),
            }),
        )
        .await;
    settle().await;
    assert!(engine.snapshot().await.messages[0].reactions.is_empty());
}

#[tokio::test]
async fn typing_stops_by_itself_after_the_idle_timeout() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    engine.set_typing(true).await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let signals = backend.signals.lock().await;
    let typing: Vec<bool> = signals
        .iter()
        .filter_map(|signal| match signal {
            SignalPayload::Typing { typing, .. } => Some(*typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing, vec![true, false]);
}

#[tokio::test]
async fn further_input_rearms_the_typing_timer() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    engine.set_typing(true).await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    engine.set_typing(true).await;
    tokio::time::sleep(Duration::from_millis(60)).await;

    {
        let signals = backend.signals.lock().await;
        let count = signals
            .iter()
            .filter(|signal| matches!(signal, SignalPayload::Typing { .. }))
            .count();
        assert_eq!(count, 1, "timer was re-armed, stop not sent yet");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let signals = backend.signals.lock().await;
    let typing: Vec<bool> = signals
        .iter()
        .filter_map(|signal| match signal {
            SignalPayload::Typing { typing, .. } => Some(*typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing, vec![true, false]);
}

#[tokio::test]
async fn sending_a_message_stops_the_typing_broadcast() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    engine.set_typing(true).await;
    engine.send_message("done typing", None).await.expect("send");

    let signals = backend.signals.lock().await;
    let typing: Vec<bool> = signals
        .iter()
        .filter_map(|signal| match signal {
            SignalPayload::Typing { typing, .. } => Some(*typing),
            _ => None,
        })
        .collect();
    assert_eq!(typing, vec![true, false]);
}

#[tokio::test]
async fn inbound_typing_signals_track_peers_and_ignore_self() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    backend
        .emit(
            &general(),
            BackendEvent::Signal(SignalEnvelope {
                channel_id: general(),
                sender: UserId::new("bob"),
                payload: SignalPayload::Typing {
                    user_id: UserId::new("bob"),
                    name: "Bob".into(),
                    typing: true,
                },
            }),
        )
        .await;
    backend
        .emit(
            &general(),
            BackendEvent::Signal(SignalEnvelope {
                channel_id: general(),
                sender: UserId::new("alice"),
                payload: SignalPayload::Typing {
                    user_id: UserId::new("alice"),
                    name: "Alice".into(),
                    typing: true,
                },
            }),
        )
        .await;
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(view.typing_users.len(), 1);
    assert_eq!(view.typing_users[0].display_name, "Bob");

    backend
        .emit(
            &general(),
            BackendEvent::Signal(SignalEnvelope {
                channel_id: general(),
                sender: UserId::new("bob"),
                payload: SignalPayload::Typing {
                    user_id: UserId::new("bob"),
                    name: "Bob".into(),
                    typing: false,
                },
            }),
        )
        .await;
    settle().await;
    assert!(engine.snapshot().await.typing_users.is_empty());
}

#[tokio::test]
async fn read_signals_overwrite_cursors_last_write_wins() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    for token in [100, 90] {
        backend
            .emit(
                &general(),
                BackendEvent::Signal(SignalEnvelope {
                    channel_id: general(),
                    sender: UserId::new("bob"),
                    payload: SignalPayload::Read {
                        user_id: UserId::new("bob"),
                        last_read: MessageToken(token),
                    },
                }),
            )
            .await;
    }
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(
        view.read_cursors.cursor(&UserId::new("bob")),
        Some(MessageToken(90))
    );
}

#[tokio::test]
async fn mark_read_coalesces_and_skips_unchanged_cursors() {
    let backend = Arc::new(
        TestBackend::new("alice").with_pages(vec![page(vec![stored(100, "bob", "latest")])]),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    engine.mark_read().await;
    engine.mark_read().await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    engine.mark_read().await;
    tokio::time::sleep(Duration::from_millis(120)).await;

    let signals = backend.signals.lock().await;
    let reads: Vec<MessageToken> = signals
        .iter()
        .filter_map(|signal| match signal {
            SignalPayload::Read { last_read, .. } => Some(*last_read),
            _ => None,
        })
        .collect();
    assert_eq!(reads, vec![MessageToken(100)]);
}

#[tokio::test]
async fn presence_poll_heals_a_drifted_roster() {
    let backend = Arc::new(TestBackend::new("alice"));
    backend
        .set_occupants(vec![Occupant {
            user_id: UserId::new("bob"),
            state: Some(PresenceState {
                name: Some("Bob".into()),
                avatar: None,
            }),
        }])
        .await;
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    assert_eq!(engine.snapshot().await.online_users.len(), 1);

    // a join the incremental stream never delivered shows up after one poll
    backend
        .set_occupants(vec![
            Occupant {
                user_id: UserId::new("bob"),
                state: Some(PresenceState {
                    name: Some("Bob".into()),
                    avatar: None,
                }),
            },
            Occupant {
                user_id: UserId::new("carol"),
                state: Some(PresenceState {
                    name: Some("Carol".into()),
                    avatar: None,
                }),
            },
        ])
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let view = engine.snapshot().await;
    assert_eq!(view.online_users.len(), 2);
}

#[tokio::test]
async fn access_denied_status_is_terminal_and_surfaced() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    let mut events = engine.subscribe_events();
    engine.activate(general()).await.expect("activate");
    settle().await;

    backend
        .emit(&general(), BackendEvent::Status(StatusEvent::AccessDenied))
        .await;
    settle().await;

    assert_eq!(engine.snapshot().await.connection, ConnectionState::Denied);

    let mut denied = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, EngineEvent::SessionDenied { .. }) {
            denied = true;
        }
    }
    assert!(denied, "fatal auth must reach the rendering layer");
}

#[tokio::test]
async fn subscribe_access_denied_fails_activation() {
    let backend = Arc::new(
        TestBackend::new("alice")
            .with_failing_subscribe(BackendError::access_denied("bad credentials")),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());

    let err = engine.activate(general()).await.expect_err("must fail");
    assert!(matches!(err, SyncError::AccessDenied(_)));
    assert_eq!(engine.snapshot().await.connection, ConnectionState::Denied);
}

#[tokio::test]
async fn network_status_events_flip_the_connection_flags() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;
    assert!(engine.snapshot().await.connection.is_connected());

    backend
        .emit(&general(), BackendEvent::Status(StatusEvent::NetworkDown))
        .await;
    settle().await;
    assert!(engine.snapshot().await.connection.is_reconnecting());

    backend
        .emit(&general(), BackendEvent::Status(StatusEvent::Reconnected))
        .await;
    settle().await;
    assert!(engine.snapshot().await.connection.is_connected());
}

#[tokio::test]
async fn reconnect_reasserts_the_local_presence_state() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;
    let before = backend.state_broadcasts.lock().await.len();
    assert!(before >= 1, "state broadcast on activation");

    backend
        .emit(&general(), BackendEvent::Status(StatusEvent::NetworkDown))
        .await;
    backend
        .emit(&general(), BackendEvent::Status(StatusEvent::Reconnected))
        .await;
    settle().await;

    let after = backend.state_broadcasts.lock().await.len();
    assert!(after > before, "state re-asserted after reconnect");
}

#[tokio::test]
async fn presence_state_failures_retry_silently() {
    let backend = Arc::new(TestBackend::new("alice").with_failing_presence_state());
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let attempts = backend.state_broadcasts.lock().await.len();
    assert!(attempts >= 2, "broadcast retried with backoff, got {attempts}");
}

#[tokio::test]
async fn switching_channels_discards_every_per_channel_slice() {
    let backend = Arc::new(TestBackend::new("alice").with_pages(vec![
        page(vec![stored(10, "bob", "in channel a")]),
        page(vec![]),
    ]));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());

    let channel_a = ChannelId::new("a");
    engine.activate(channel_a.clone()).await.expect("activate a");
    settle().await;
    backend
        .emit(
            &channel_a,
            BackendEvent::Signal(SignalEnvelope {
                channel_id: channel_a.clone(),
                sender: UserId::new("bob"),
                payload: SignalPayload::Typing {
                    user_id: UserId::new("bob"),
                    name: "Bob".into(),
                    typing: true,
                },
            }),
        )
        .await;
    settle().await;
    let view = engine.snapshot().await;
    assert_eq!(view.messages.len(), 1);
    assert_eq!(view.typing_users.len(), 1);

    engine
        .activate(ChannelId::new("b"))
        .await
        .expect("activate b");
    settle().await;

    let view = engine.snapshot().await;
    assert_eq!(view.channel_id, Some(ChannelId::new("b")));
    assert!(view.messages.is_empty());
    assert!(view.typing_users.is_empty());
    assert!(view.read_cursors.is_empty());
    assert!(!view.has_more_history);
}

#[tokio::test]
async fn blank_sends_are_rejected_locally() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    let err = engine
        .send_message("   \n", None)
        .await
        .expect_err("blank text");
    assert!(matches!(err, SyncError::EmptyMessage));
    assert!(backend.published.lock().await.is_empty());
    assert!(engine.snapshot().await.messages.is_empty());
}

#[tokio::test]
async fn file_only_sends_are_allowed() {
    let backend = Arc::new(TestBackend::new("alice"));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");

    engine
        .send_message(
            "",
            Some(shared::protocol::FileRef {
                file_id: "f-1".into(),
                name: "photo.png".into(),
                url: None,
            }),
        )
        .await
        .expect("file send");

    let view = engine.snapshot().await;
    assert_eq!(view.messages.len(), 1);
    assert!(view.messages[0].text.is_none());
    assert_eq!(
        view.messages[0].file.as_ref().map(|f| f.name.as_str()),
        Some("photo.png")
    );
}

#[tokio::test]
async fn remove_reaction_uses_the_locally_owned_action_token() {
    let mut message = stored(100, "bob", "hello");
    message.actions.push(reaction(42, 100, "alice", "❤️"));
    let backend = Arc::new(TestBackend::new("alice").with_pages(vec![page(vec![message])]));
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;

    // nothing of ours under 👍, so no backend call; ❤️ resolves token 42
    engine.remove_reaction(MessageToken(100), "👍").await;
    engine.remove_reaction(MessageToken(100), "❤️").await;
    let removed = backend.removed_actions.lock().await.clone();
    assert_eq!(removed, vec![(MessageToken(100), ActionToken(42))]);

    let view = engine.snapshot().await;
    // removal only lands once the backend fans the event back in
    backend
        .emit(
            &general(),
            BackendEvent::Action(ActionEvent {
                channel_id: general(),
                op: ActionOp::Removed,
                action: reaction(42, 100, "alice", "❤️"),
            }),
        )
        .await;
    settle().await;
    assert_eq!(view.messages[0].reactions.marks("❤️").len(), 1);
    assert!(engine.snapshot().await.messages[0].reactions.is_empty());
}

#[tokio::test]
async fn deactivate_clears_state_and_unsubscribes() {
    let backend = Arc::new(
        TestBackend::new("alice").with_pages(vec![page(vec![stored(10, "bob", "hello")])]),
    );
    let engine = SyncEngine::new(backend.clone(), profile("alice", "Alice"), test_config());
    engine.activate(general()).await.expect("activate");
    settle().await;
    assert_eq!(engine.snapshot().await.messages.len(), 1);

    engine.deactivate().await;
    let view = engine.snapshot().await;
    assert!(view.channel_id.is_none());
    assert!(view.messages.is_empty());
    assert_eq!(view.connection, ConnectionState::Disconnected);
    assert!(backend.streams.lock().await.is_empty());
}
