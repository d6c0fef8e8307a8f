use crate::fixtures::{data_line, drain, session_over, settings, streamed_reply, wait_for};
use parlor_core::transport::REFRESH_PATH;
use parlor_core::{
    CacheScope, ClientError, MessageId, MessageRole, MockExchange, MockReply, Phase, SendOutcome,
    SessionEvent,
};
use serde_json::json;
use std::time::Duration;

const SEND: &str = "/api/chat/send";

fn roles_and_text(session: &parlor_core::ChatSession) -> Vec<(MessageRole, String)> {
    session
        .transcript()
        .into_iter()
        .map(|message| (message.role, message.content))
        .collect()
}

#[tokio::test]
async fn first_message_creates_and_adopts_the_conversation() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(42), &["Hi", " there"]));
    let mut harness = session_over(&mock, &settings());

    let outcome = harness.session.send("Hello", None).await;

    assert!(matches!(
        &outcome,
        SendOutcome::Completed { conversation_id: Some(42), reply } if reply.content == "Hi there"
    ));
    assert_eq!(
        roles_and_text(&harness.session),
        vec![
            (MessageRole::User, "Hello".to_string()),
            (MessageRole::Assistant, "Hi there".to_string()),
        ]
    );
    let state = harness.session.snapshot();
    assert_eq!(state.conversation_id, Some(42));
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.streaming_buffer.is_empty());
    assert!(state.transcript.iter().all(|message| !message.id.is_provisional()));

    let events = drain(&mut harness.events);
    assert_eq!(
        events,
        vec![
            SessionEvent::PhaseChanged(Phase::Sending),
            SessionEvent::ConversationAdopted(42),
            SessionEvent::PhaseChanged(Phase::StreamingResponse),
            SessionEvent::Delta("Hi".into()),
            SessionEvent::Delta(" there".into()),
            SessionEvent::Completed(state.transcript[1].clone()),
            SessionEvent::Invalidate(CacheScope::ConversationList),
            SessionEvent::Invalidate(CacheScope::Conversation(42)),
            SessionEvent::PhaseChanged(Phase::Idle),
        ]
    );
}

#[tokio::test]
async fn later_sends_use_the_adopted_id() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(42), &["one"]))
        .on_post(SEND, streamed_reply(Some(42), &["two"]));
    let harness = session_over(&mock, &settings());

    harness.session.send("first", None).await;
    harness.session.send("second", None).await;

    let calls: Vec<_> = mock
        .calls()
        .into_iter()
        .filter(|call| call.path == SEND)
        .map(|call| call.body.expect("body"))
        .collect();
    assert!(calls[0].get("conversation_id").is_none());
    assert_eq!(calls[1]["conversation_id"], 42);
    assert_eq!(harness.session.transcript().len(), 4);
}

#[tokio::test]
async fn existing_conversation_id_is_never_overwritten() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(99), &["ok"]));
    let mut harness = session_over(&mock, &settings());
    assert!(harness.session.select_conversation(Some(7)));

    harness.session.send("Hello", None).await;

    assert_eq!(harness.session.conversation_id(), Some(7));
    assert!(!drain(&mut harness.events)
        .iter()
        .any(|event| matches!(event, SessionEvent::ConversationAdopted(_))));
}

#[tokio::test]
async fn split_records_reassemble_inside_the_session() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([
            r#"data: {"content":"Hel"#,
            "lo\"}\n",
            "data: {\"done\":true}\n",
        ]),
    );
    let harness = session_over(&mock, &settings());

    let outcome = harness.session.send("greet me", None).await;

    assert!(matches!(outcome, SendOutcome::Completed { reply, .. } if reply.content == "Hello"));
}

#[tokio::test]
async fn stream_error_rolls_back_to_the_pre_send_transcript() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(5), &["fine"]))
        .on_post(
            SEND,
            MockReply::event_stream([
                data_line(json!({"content": "partial"})),
                data_line(json!({"error": "OpenAI API key not configured."})),
            ]),
        );
    let mut harness = session_over(&mock, &settings());
    harness.session.send("warm up", None).await;
    let before = harness.session.transcript();
    drain(&mut harness.events);

    let outcome = harness.session.send("this will fail", None).await;

    match outcome {
        SendOutcome::Failed { error, message } => {
            assert!(matches!(error, ClientError::Stream(_)));
            assert_eq!(message, "OpenAI API key not configured.");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let state = harness.session.snapshot();
    assert_eq!(state.transcript, before);
    assert_eq!(state.phase, Phase::Idle);
    assert!(state.streaming_buffer.is_empty());

    let phases: Vec<_> = drain(&mut harness.events)
        .into_iter()
        .filter_map(|event| match event {
            SessionEvent::PhaseChanged(phase) => Some(phase),
            _ => None,
        })
        .collect();
    assert_eq!(
        phases,
        vec![
            Phase::Sending,
            Phase::StreamingResponse,
            Phase::Errored,
            Phase::Idle
        ]
    );
}

#[tokio::test]
async fn transport_failures_roll_back() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([data_line(json!({"content": "par"}))]).then_fail("connection reset"),
    )
    .on_post(SEND, MockReply::event_stream([data_line(json!({"content": "cut"}))]))
    .on_post(
        SEND,
        MockReply::json(404, json!({"detail": "Conversation not found"})),
    );
    let mut harness = session_over(&mock, &settings());

    let broken = harness.session.send("one", None).await;
    assert!(matches!(
        broken,
        SendOutcome::Failed { error: ClientError::Network(_), .. }
    ));
    let closed = harness.session.send("two", None).await;
    assert!(matches!(
        closed,
        SendOutcome::Failed { error: ClientError::StreamTerminated(_), .. }
    ));
    let rejected = harness.session.send("three", None).await;
    match rejected {
        SendOutcome::Failed { message, .. } => assert_eq!(message, "Conversation not found"),
        other => panic!("unexpected outcome: {other:?}"),
    }

    assert!(harness.session.transcript().is_empty());
    assert_eq!(harness.session.phase(), Phase::Idle);
    let failures = drain(&mut harness.events)
        .into_iter()
        .filter(|event| matches!(event, SessionEvent::Failed(_)))
        .count();
    assert_eq!(failures, 3);
}

#[tokio::test]
async fn expired_session_during_send_rolls_back_and_redirects() {
    let mock = MockExchange::new();
    mock.on_post(SEND, MockReply::status(401))
        .on_post(REFRESH_PATH, MockReply::status(401));
    let mut harness = session_over(&mock, &settings());
    harness.session.api().transport().set_location("/chat");

    let outcome = harness.session.send("hello?", None).await;

    assert!(matches!(
        outcome,
        SendOutcome::Failed { error: ClientError::Authentication { .. }, .. }
    ));
    assert!(harness.session.transcript().is_empty());
    assert_eq!(drain(&mut harness.navigation).len(), 1);
}

#[tokio::test]
async fn blank_text_is_a_no_op() {
    let mock = MockExchange::new();
    let mut harness = session_over(&mock, &settings());

    assert!(matches!(
        harness.session.send("   \n\t", None).await,
        SendOutcome::Rejected
    ));
    assert!(mock.calls().is_empty());
    assert!(drain(&mut harness.events).is_empty());
}

#[tokio::test]
async fn second_send_is_rejected_until_the_first_settles() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([data_line(json!({"content": "thinking"}))]).then_stall(),
    )
    .on_post(SEND, streamed_reply(None, &["done now"]));
    let mut harness = session_over(&mock, &settings());

    let session = harness.session.clone();
    let first = tokio::spawn(async move { session.send("first", None).await });
    wait_for(&mut harness.events, |event| {
        matches!(event, SessionEvent::Delta(_))
    })
    .await;

    assert!(matches!(
        harness.session.send("second", None).await,
        SendOutcome::Rejected
    ));
    assert!(!harness.session.select_conversation(Some(3)));
    assert_eq!(mock.call_count(SEND), 1);

    assert!(harness.session.cancel());
    assert!(matches!(first.await.expect("join"), SendOutcome::Cancelled));
    assert_eq!(harness.session.phase(), Phase::Idle);

    let third = harness.session.send("third", None).await;
    assert!(matches!(third, SendOutcome::Completed { .. }));
}

#[tokio::test]
async fn cancel_before_headers_rolls_back_silently() {
    let mock = MockExchange::new();
    mock.on_post(SEND, MockReply::status(200).hanging());
    let mut harness = session_over(&mock, &settings());

    let session = harness.session.clone();
    let pending = tokio::spawn(async move { session.send("never answered", None).await });
    wait_for(&mut harness.events, |event| {
        *event == SessionEvent::PhaseChanged(Phase::Sending)
    })
    .await;
    assert!(harness.session.cancel());

    assert!(matches!(pending.await.expect("join"), SendOutcome::Cancelled));
    assert!(harness.session.transcript().is_empty());
    let events = drain(&mut harness.events);
    assert!(events.contains(&SessionEvent::Cancelled));
    assert!(!events
        .iter()
        .any(|event| matches!(event, SessionEvent::Failed(_) | SessionEvent::Invalidate(_))));
}

#[tokio::test]
async fn cancel_while_streaming_keeps_the_user_message() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([data_line(json!({"content": "Once upon"}))])
            .header("X-Conversation-Id", "11")
            .then_stall(),
    );
    let mut harness = session_over(&mock, &settings());

    let session = harness.session.clone();
    let pending = tokio::spawn(async move { session.send("tell me a story", None).await });
    wait_for(&mut harness.events, |event| {
        matches!(event, SessionEvent::Delta(_))
    })
    .await;
    harness.session.cancel();

    assert!(matches!(pending.await.expect("join"), SendOutcome::Cancelled));
    let state = harness.session.snapshot();
    assert_eq!(state.conversation_id, Some(11));
    assert_eq!(state.transcript.len(), 1);
    assert!(matches!(state.transcript[0].id, MessageId::Local(_)));
    assert!(state.streaming_buffer.is_empty());
    let events = drain(&mut harness.events);
    assert!(events.contains(&SessionEvent::Invalidate(CacheScope::Conversation(11))));
    assert!(!harness.session.cancel());
}

#[tokio::test]
async fn stalled_stream_times_out() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([data_line(json!({"content": "slow"}))]).then_stall(),
    );
    let settings = settings().with_stall_timeout(Duration::from_millis(50));
    let harness = session_over(&mock, &settings);

    let outcome = harness.session.send("hello", None).await;

    assert!(matches!(
        outcome,
        SendOutcome::Failed { error: ClientError::Stalled(_), .. }
    ));
    assert!(harness.session.transcript().is_empty());
}

#[tokio::test]
async fn load_reconciles_with_server_messages() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(8), &["Bonjour"]))
        .on_get(
            "/api/chat/onload",
            MockReply::json(
                200,
                json!({
                    "conversations": [
                        {"id": 8, "title": "New Chat", "created_at": "2024-05-01T10:00:00", "updated_at": "2024-05-01T10:00:01"}
                    ],
                    "current_conversation": {
                        "id": 8,
                        "title": "New Chat",
                        "messages": [
                            {"id": 80, "role": "user", "content": "Hello", "created_at": "2024-05-01T10:00:00"},
                            {"id": 81, "role": "assistant", "content": "Bonjour", "created_at": "2024-05-01T10:00:01"}
                        ]
                    }
                }),
            ),
        );
    let harness = session_over(&mock, &settings());
    harness.session.send("Hello", None).await;

    let data = harness.session.load(Some(8)).await.expect("load");

    assert_eq!(data.conversations.len(), 1);
    let ids: Vec<_> = harness
        .session
        .transcript()
        .into_iter()
        .map(|message| message.id)
        .collect();
    assert_eq!(ids, vec![MessageId::Server(80), MessageId::Server(81)]);
}

#[tokio::test]
async fn rename_invalidates_and_failures_leave_state_alone() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(2), &["sure"]))
        .on_post("/api/chat/update", MockReply::json(200, json!({"success": true})))
        .on_post(
            "/api/chat/update",
            MockReply::json(404, json!({"detail": "Conversation not found"})),
        );
    let mut harness = session_over(&mock, &settings());
    harness.session.send("hi", None).await;
    let before = harness.session.snapshot();
    drain(&mut harness.events);

    harness.session.rename(2, "  Trip ideas ").await.expect("rename");
    assert_eq!(
        drain(&mut harness.events),
        vec![
            SessionEvent::Invalidate(CacheScope::ConversationList),
            SessionEvent::Invalidate(CacheScope::Conversation(2)),
        ]
    );
    assert_eq!(
        mock.last_call("/api/chat/update").unwrap().body.unwrap()["title"],
        "Trip ideas"
    );

    let err = harness.session.rename(2, "Again").await.unwrap_err();
    assert_eq!(err.user_message(), "Conversation not found");
    assert!(drain(&mut harness.events).is_empty());
    assert_eq!(harness.session.snapshot(), before);

    let blank = harness.session.rename(2, "   ").await.unwrap_err();
    assert!(matches!(blank, ClientError::InvalidInput(_)));
    assert_eq!(mock.call_count("/api/chat/update"), 2);
}

#[tokio::test]
async fn deleting_the_open_conversation_clears_the_selection() {
    let mock = MockExchange::new();
    mock.on_post(SEND, streamed_reply(Some(6), &["ok"]))
        .on_post("/api/chat/delete", MockReply::json(200, json!({"success": true})))
        .on_post("/api/chat/delete", MockReply::json(200, json!({"success": true})));
    let mut harness = session_over(&mock, &settings());
    harness.session.send("hi", None).await;
    drain(&mut harness.events);

    harness.session.delete(99).await.expect("delete other");
    assert_eq!(harness.session.conversation_id(), Some(6));
    assert_eq!(harness.session.transcript().len(), 2);

    harness.session.delete(6).await.expect("delete open");
    assert_eq!(harness.session.conversation_id(), None);
    assert!(harness.session.transcript().is_empty());
    assert!(drain(&mut harness.events).contains(&SessionEvent::SelectionCleared));
}

#[tokio::test]
async fn cancelled_send_does_not_strand_the_refresh() {
    let mock = MockExchange::new();
    mock.on_post(SEND, MockReply::status(401)).on_post(
        REFRESH_PATH,
        MockReply::status(200).delayed(Duration::from_millis(50)),
    );
    let mut harness = session_over(&mock, &settings());

    let session = harness.session.clone();
    let pending = tokio::spawn(async move { session.send("hello", None).await });
    wait_for(&mut harness.events, |event| {
        *event == SessionEvent::PhaseChanged(Phase::Sending)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(harness.session.api().transport().refresh_in_flight());
    harness.session.cancel();
    assert!(matches!(pending.await.expect("join"), SendOutcome::Cancelled));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!harness.session.api().transport().refresh_in_flight());
    assert_eq!(mock.call_count(REFRESH_PATH), 1);
    assert!(drain(&mut harness.navigation).is_empty());
}

#[tokio::test]
async fn keepalive_bytes_hold_off_the_stall_timeout() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([
            ": ping\n".to_string(),
            ": ping\n".to_string(),
            ": ping\n".to_string(),
            ": ping\n".to_string(),
            data_line(json!({"content": "ok"})),
            data_line(json!({"done": true})),
        ])
        .paced(Duration::from_millis(60)),
    );
    let settings = settings().with_stall_timeout(Duration::from_millis(150));
    let harness = session_over(&mock, &settings);

    let outcome = harness.session.send("still there?", None).await;

    assert!(
        matches!(&outcome, SendOutcome::Completed { reply, .. } if reply.content == "ok"),
        "{outcome:?}"
    );
}

#[tokio::test]
async fn open_conversation_cannot_be_deleted_mid_reply() {
    let mock = MockExchange::new();
    mock.on_post(
        SEND,
        MockReply::event_stream([data_line(json!({"content": "working"}))]).then_stall(),
    );
    let mut harness = session_over(&mock, &settings());
    assert!(harness.session.select_conversation(Some(6)));

    let session = harness.session.clone();
    let pending = tokio::spawn(async move { session.send("hi", None).await });
    wait_for(&mut harness.events, |event| {
        matches!(event, SessionEvent::Delta(_))
    })
    .await;

    let err = harness.session.delete(6).await.unwrap_err();
    assert!(matches!(err, ClientError::InvalidInput(_)));
    assert_eq!(mock.call_count("/api/chat/delete"), 0);
    assert_eq!(harness.session.conversation_id(), Some(6));

    harness.session.cancel();
    assert!(matches!(pending.await.expect("join"), SendOutcome::Cancelled));
}
