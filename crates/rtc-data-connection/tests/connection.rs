//! Connection lifecycle tests on the in-memory transport

mod common;

use common::{drain, kinds, wait_for, Pair};
use rtc_data_connection::{
    ChannelMessage, Connection, ConnectionConfig, ConnectionError, ConnectionEvent,
    ConnectionState, EventKind, IceCandidate, LoopbackRelay, MockNetwork, Role,
    SessionDescription, DATA_CHANNEL_LABEL,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::test]
async fn test_loopback_open_and_message() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = pair.open().await;

    assert_eq!(pair.a.state().await, ConnectionState::Open);
    assert_eq!(pair.b.state().await, ConnectionState::Open);
    assert!(pair.a.is_open().await);

    pair.b.send_text("hello, world!").await.unwrap();
    match wait_for(&mut pair.a_events, EventKind::Message).await {
        ConnectionEvent::Message(msg) => {
            assert!(msg.is_string);
            assert_eq!(msg.as_text(), Some("hello, world!"));
        }
        other => panic!("unexpected event {:?}", other),
    }

    let payload = vec![0u8, 1, 2, 127, 128, 255];
    pair.a.send(payload.clone()).await.unwrap();
    match wait_for(&mut pair.b_events, EventKind::Message).await {
        ConnectionEvent::Message(msg) => {
            assert!(!msg.is_string);
            assert_eq!(msg.data.as_ref(), payload.as_slice());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_responder_sees_connect_before_open() {
    let network = MockNetwork::new();
    let factory = network.factory();
    let a = Connection::new(Role::Initiator, ConnectionConfig::default(), &factory)
        .await
        .unwrap();
    let b = Connection::new(Role::Responder, ConnectionConfig::default(), &factory)
        .await
        .unwrap();
    let mut b_events = b.events();
    let _relay = LoopbackRelay::connect(&a, &b);
    a.create_offer().await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = wait_for_any(&mut b_events).await;
        let done = event == ConnectionEvent::Open;
        seen.push(event.kind());
        if done {
            break;
        }
    }
    let connect = seen.iter().position(|k| *k == EventKind::Connect);
    let open = seen.iter().position(|k| *k == EventKind::Open);
    assert!(connect.is_some(), "no connect in {:?}", seen);
    assert!(connect < open);
    assert!(seen.contains(&EventKind::Answer));
    assert!(!seen.contains(&EventKind::Offer));
}

async fn wait_for_any(events: &mut mpsc::UnboundedReceiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(common::EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event stream ended")
}

#[tokio::test]
async fn test_messages_arrive_in_send_order() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = pair.open().await;

    for i in 0..20u8 {
        pair.a.send(vec![i]).await.unwrap();
    }
    for i in 0..20u8 {
        match wait_for(&mut pair.b_events, EventKind::Message).await {
            ConnectionEvent::Message(msg) => assert_eq!(msg.data.as_ref(), &[i]),
            other => panic!("unexpected event {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_send_before_open_is_dropped() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;

    // No channel yet
    pair.a.send_text("too early").await.unwrap();
    pair.b.send_text("too early").await.unwrap();

    // Channel exists but is still connecting
    pair.a.create_offer().await.unwrap();
    pair.a.send_text("still too early").await.unwrap();

    let _relay = LoopbackRelay::connect(&pair.a, &pair.b);
    let offer = pair.a.create_offer().await;
    assert!(matches!(offer, Err(ConnectionError::InvalidState(_))));

    // The relay subscribed after the offer went out; deliver it by hand
    let a_seen = drain(&mut pair.a_events).await;
    let offer = a_seen
        .iter()
        .find_map(|e| match e {
            ConnectionEvent::Offer(desc) => Some(desc.clone()),
            _ => None,
        })
        .unwrap();
    for event in &a_seen {
        if let ConnectionEvent::Candidate(c) = event {
            pair.b.add_candidate(c.clone()).await.unwrap();
        }
    }
    pair.b.set_description(offer).await.unwrap();
    pair.b.create_answer().await.unwrap();

    wait_for(&mut pair.a_events, EventKind::Open).await;
    wait_for(&mut pair.b_events, EventKind::Open).await;

    pair.a.send_text("after open").await.unwrap();
    let b_seen = drain(&mut pair.b_events).await;
    let messages: Vec<&ChannelMessage> = b_seen
        .iter()
        .filter_map(|e| match e {
            ConnectionEvent::Message(msg) => Some(msg),
            _ => None,
        })
        .collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].as_text(), Some("after open"));
    assert!(!kinds(&b_seen).contains(&EventKind::Error));
    assert!(!kinds(&a_seen).contains(&EventKind::Error));
}

#[tokio::test]
async fn test_candidates_before_and_after_local_description() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;

    let offer = pair.a.create_offer().await.unwrap();
    let a_candidate = match wait_for(&mut pair.a_events, EventKind::Candidate).await {
        ConnectionEvent::Candidate(c) => c,
        other => panic!("unexpected event {:?}", other),
    };
    assert!(a_candidate.candidate.starts_with("candidate:"));

    // Responder has no descriptions at all yet
    pair.b.add_candidate(a_candidate).await.unwrap();
    pair.b.set_description(offer).await.unwrap();
    let answer = pair.b.create_answer().await.unwrap();
    let b_candidate = match wait_for(&mut pair.b_events, EventKind::Candidate).await {
        ConnectionEvent::Candidate(c) => c,
        other => panic!("unexpected event {:?}", other),
    };

    // Initiator has its local description but not the remote one
    pair.a.add_candidate(b_candidate).await.unwrap();
    pair.a.set_description(answer).await.unwrap();

    wait_for(&mut pair.a_events, EventKind::Open).await;
    wait_for(&mut pair.b_events, EventKind::Open).await;
}

#[tokio::test]
async fn test_offer_sdp_bandwidth_rewritten() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;

    let offer = pair.a.create_offer().await.unwrap();
    assert!(offer.sdp.contains("b=AS:102400"));
    assert!(!offer.sdp.contains("b=AS:30\r\n"));

    match wait_for(&mut pair.a_events, EventKind::Offer).await {
        ConnectionEvent::Offer(emitted) => assert_eq!(emitted, offer),
        other => panic!("unexpected event {:?}", other),
    }

    pair.b.set_description(offer).await.unwrap();
    let answer = pair.b.create_answer().await.unwrap();
    assert!(answer.sdp.contains("b=AS:102400"));
}

#[tokio::test]
async fn test_unreliable_channel_options() {
    let mut pair = Pair::new(ConnectionConfig::unreliable()).await;
    let _relay = pair.open().await;

    let inbound = pair.factory.inbound_channels();
    assert_eq!(inbound.len(), 1);
    assert_eq!(inbound[0].label(), DATA_CHANNEL_LABEL);
    assert!(!inbound[0].ordered());
    assert_eq!(inbound[0].max_retransmits(), Some(0));
}

#[tokio::test]
async fn test_reliable_channel_options() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = pair.open().await;

    let inbound = pair.factory.inbound_channels();
    assert_eq!(inbound.len(), 1);
    assert!(inbound[0].ordered());
    assert_eq!(inbound[0].max_retransmits(), None);
}

#[tokio::test]
async fn test_offer_failure_emits_error_and_retry_succeeds() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = LoopbackRelay::connect(&pair.a, &pair.b);

    pair.factory.transport.fail_offers(1);
    let result = pair.a.create_offer().await;
    assert!(matches!(result, Err(ConnectionError::Negotiation(_))));
    match wait_for(&mut pair.a_events, EventKind::Error).await {
        ConnectionEvent::Error(e) => assert_eq!(Err(e), result.map(|_| ())),
        other => panic!("unexpected event {:?}", other),
    }

    pair.a.create_offer().await.unwrap();
    wait_for(&mut pair.a_events, EventKind::Open).await;
    wait_for(&mut pair.b_events, EventKind::Open).await;
}

#[tokio::test]
async fn test_answer_failure_emits_error() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let offer = pair.a.create_offer().await.unwrap();
    pair.b.set_description(offer).await.unwrap();

    pair.factory.transport.fail_answers(1);
    let result = pair.b.create_answer().await;
    assert!(matches!(result, Err(ConnectionError::Negotiation(_))));
    wait_for(&mut pair.b_events, EventKind::Error).await;

    pair.b.create_answer().await.unwrap();
}

#[tokio::test]
async fn test_role_violations_are_rejected_quietly() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;

    assert_eq!(
        pair.b.create_offer().await,
        Err(ConnectionError::WrongRole(Role::Responder))
    );
    assert_eq!(
        pair.a.create_answer().await,
        Err(ConnectionError::WrongRole(Role::Initiator))
    );
    assert!(matches!(
        pair.b.create_answer().await,
        Err(ConnectionError::InvalidState(_))
    ));
    assert!(matches!(
        pair.a.set_description(SessionDescription::answer("v=0\r\n")).await,
        Err(ConnectionError::InvalidState(_))
    ));
    assert!(matches!(
        pair.a.set_description(SessionDescription::offer("v=0\r\n")).await,
        Err(ConnectionError::InvalidState(_))
    ));
    assert!(matches!(
        pair.b.set_description(SessionDescription::answer("v=0\r\n")).await,
        Err(ConnectionError::InvalidState(_))
    ));

    assert!(drain(&mut pair.a_events).await.is_empty());
    assert!(drain(&mut pair.b_events).await.is_empty());
}

#[tokio::test]
async fn test_invalid_remote_description_emits_error() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;

    let result = pair
        .b
        .set_description(SessionDescription::offer("not an sdp"))
        .await;
    assert!(matches!(result, Err(ConnectionError::Transport(_))));
    wait_for(&mut pair.b_events, EventKind::Error).await;
}

#[tokio::test]
async fn test_close_never_opened_emits_no_close() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    assert_eq!(pair.network.peer_count().await, 2);

    pair.b.close().await.unwrap();
    assert_eq!(pair.b.state().await, ConnectionState::Closed);
    assert_eq!(pair.network.peer_count().await, 1);

    let seen = drain(&mut pair.b_events).await;
    assert!(!kinds(&seen).contains(&EventKind::Close), "{:?}", seen);

    pair.b.send_text("ignored").await.unwrap();
    assert_eq!(pair.b.create_answer().await, Err(ConnectionError::Closed));
}

#[tokio::test]
async fn test_double_close_is_noop() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = pair.open().await;

    pair.a.close().await.unwrap();
    pair.a.close().await.unwrap();
    pair.b.close().await.unwrap();
    pair.b.close().await.unwrap();

    assert_eq!(pair.a.state().await, ConnectionState::Closed);
    assert_eq!(pair.b.state().await, ConnectionState::Closed);
    assert_eq!(pair.network.peer_count().await, 0);
}

#[tokio::test]
async fn test_send_after_close_is_noop() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = pair.open().await;

    pair.a.close().await.unwrap();
    wait_for(&mut pair.b_events, EventKind::Close).await;
    assert!(!pair.a.is_open().await);

    pair.a.send_text("after close").await.unwrap();
    pair.b.send_text("after close").await.unwrap();

    let a_seen = drain(&mut pair.a_events).await;
    let b_seen = drain(&mut pair.b_events).await;
    assert!(!kinds(&a_seen).contains(&EventKind::Message));
    assert!(!kinds(&b_seen).contains(&EventKind::Message));
    assert!(!kinds(&a_seen).contains(&EventKind::Error));
}

#[tokio::test]
async fn test_network_loss_closes_channels() {
    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let _relay = pair.open().await;

    pair.network.disconnect_all().await;
    wait_for(&mut pair.a_events, EventKind::Close).await;
    wait_for(&mut pair.b_events, EventKind::Close).await;

    assert_eq!(pair.a.state().await, ConnectionState::Closed);
    assert!(!pair.b.is_open().await);
    pair.a.send_text("lost").await.unwrap();

    // The peer connections are still held until close
    assert_eq!(pair.network.peer_count().await, 2);
    pair.a.close().await.unwrap();
    pair.b.close().await.unwrap();
    assert_eq!(pair.network.peer_count().await, 0);
}

#[tokio::test]
async fn test_close_from_inside_event_handler() {
    let pair = Pair::new(ConnectionConfig::default()).await;
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();

    let conn = pair.a.clone();
    pair.a.subscribe(EventKind::Candidate, move |_| {
        let conn = conn.clone();
        let done_tx = done_tx.clone();
        tokio::spawn(async move {
            let _ = done_tx.send(conn.close().await);
        });
    });

    pair.a.create_offer().await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), done_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(closed, Ok(()));
    assert_eq!(pair.a.state().await, ConnectionState::Closed);
    pair.a.close().await.unwrap();
}

#[tokio::test]
async fn test_subscriptions_by_kind() {
    let pair = Pair::new(ConnectionConfig::default()).await;
    let offers = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let all = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let counter = offers.clone();
    let sub = pair.a.subscribe(EventKind::Offer, move |event| {
        assert_eq!(event.kind(), EventKind::Offer);
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });
    let counter = all.clone();
    pair.a.subscribe_all(move |_| {
        counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    });

    pair.a.create_offer().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(offers.load(std::sync::atomic::Ordering::SeqCst), 1);
    // offer plus one trickled candidate
    assert!(all.load(std::sync::atomic::Ordering::SeqCst) >= 2);

    assert!(pair.a.unsubscribe(&sub));
    assert!(!pair.a.unsubscribe(&sub));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let network = MockNetwork::new();
    let factory = network.factory();
    let mut config = ConnectionConfig::default();
    config.peer_connection.ice_servers[0].urls.clear();

    let result = Connection::new(Role::Initiator, config, &factory).await;
    assert!(matches!(result, Err(ConnectionError::InvalidConfig(_))));
    assert_eq!(network.peer_count().await, 0);
}

#[tokio::test]
async fn test_multibyte_candidate_with_debug_logging() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let mut pair = Pair::new(ConnectionConfig::default()).await;
    let offer = pair.a.create_offer().await.unwrap();
    pair.b.set_description(offer).await.unwrap();

    // The log prefix limit falls inside the two-byte 'é'
    let candidate = IceCandidate::new(format!("candidate:{}é tail", "x".repeat(39)));
    pair.b.add_candidate(candidate).await.unwrap();

    let seen = drain(&mut pair.b_events).await;
    assert!(!kinds(&seen).contains(&EventKind::Error));
}
