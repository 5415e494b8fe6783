//! Bootstrap and Fetch Integration Tests
//!
//! Drives a real `ProtocolConnection` against the loopback fake upstream:
//! handshake, schema, universe revision, seeds, then request/response.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use market_gateway::application::ports::{Command, MarketState, MarketStatus, Request};
use market_gateway::infrastructure::broadcast::{EventHub, LifecycleEvent};
use market_gateway::infrastructure::codec::ResponsePayload;
use market_gateway::{
    ConnectionSettings, ConnectionState, FetchOptions, GatewayError, MsgPackCodec,
    ProtocolConnection, SubscriptionId, Token,
};
use serde_json::Value;
use tokio::time::timeout;

use common::{FakeUpstream, Reply, TOKEN, market_row, quote_row, responder};

const WAIT: Duration = Duration::from_secs(5);

fn connection(settings: ConnectionSettings) -> (Arc<ProtocolConnection>, Arc<EventHub>) {
    let events = Arc::new(EventHub::with_defaults());
    let connection = Arc::new(ProtocolConnection::new(
        1,
        Arc::new(MsgPackCodec::new()),
        settings,
        Arc::clone(&events),
    ));
    (connection, events)
}

async fn bootstrapped(upstream: &FakeUpstream) -> (Arc<ProtocolConnection>, Arc<EventHub>) {
    let (connection, events) = connection(ConnectionSettings::default());
    timeout(WAIT, connection.connect(&upstream.url(), &Token::new(TOKEN)))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    timeout(WAIT, connection.wait_seeds_loaded())
        .await
        .expect("seeds timed out")
        .expect("seeds failed");
    (connection, events)
}

async fn wait_for_requests(upstream: &FakeUpstream, command: Command, count: usize) {
    timeout(WAIT, async {
        while upstream.requests_for(command).len() < count {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("request never reached upstream");
}

#[tokio::test]
async fn test_bootstrap_sends_one_seeds_request_and_loads_empty_index() {
    let upstream = FakeUpstream::start().await;
    let (connection, events) = connection(ConnectionSettings::default());
    let mut lifecycle = events.lifecycle_rx();

    timeout(WAIT, connection.connect(&upstream.url(), &Token::new(TOKEN)))
        .await
        .unwrap()
        .unwrap();
    assert!(connection.is_ready());

    timeout(WAIT, connection.wait_seeds_loaded())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);

    assert_eq!(upstream.handshake_tokens(), vec![TOKEN.to_string()]);

    let seeds = upstream.requests_for(Command::UniverseSeeds);
    assert_eq!(seeds.len(), 1);
    let Request::UniverseSeeds(request) = &seeds[0].1 else {
        panic!("expected a seeds request");
    };
    assert_eq!(request.market, "DCE");
    assert_eq!(request.qualified_name, "SampleQuote");
    assert_eq!(request.revision, 1);
    assert_eq!(request.trade_day, 20_250_101);

    let markets = connection.markets();
    let dce = markets.get("DCE").unwrap();
    assert_eq!(dce.trade_day, 20_250_101);
    assert_eq!(dce.revisions.get("SampleQuote"), Some(&1));

    let securities = connection.securities();
    assert_eq!(securities.market("DCE").map(<[_]>::len), Some(0));

    let mut saw_seeds_loaded = false;
    while let Ok(event) = lifecycle.try_recv() {
        if matches!(event, LifecycleEvent::SeedsLoaded { securities: 0, .. }) {
            saw_seeds_loaded = true;
        }
    }
    assert!(saw_seeds_loaded);
}

#[tokio::test]
async fn test_sequence_ids_increase_across_requests() {
    let upstream = FakeUpstream::start().await;
    let (connection, _events) = bootstrapped(&upstream).await;

    for code in ["i2409", "i2501"] {
        connection
            .fetch_by_code("DCE", code, FetchOptions::new("SampleQuote"))
            .await
            .unwrap();
    }

    let sequence_ids: Vec<u32> = upstream.requests().iter().map(|(seq, _)| *seq).collect();
    assert!(sequence_ids.windows(2).all(|pair| pair[0] < pair[1]));
}

#[tokio::test]
async fn test_fetch_by_code_projects_requested_fields() {
    let upstream = FakeUpstream::start().await;
    let (connection, _events) = bootstrapped(&upstream).await;

    let result = timeout(
        WAIT,
        connection.fetch_by_code(
            "DCE",
            "i2409",
            FetchOptions::new("SampleQuote").fields(["close", "volume"]),
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(result.count, 3);
    assert_eq!(result.records.len(), 3);
    for record in &result.records {
        let names: Vec<&str> = record.fields.keys().map(String::as_str).collect();
        assert_eq!(names, ["close", "volume"]);
        assert_eq!(record.fields["volume"], Value::String("1000".into()));
        assert_eq!(record.code, "i2409");
    }

    let fetches = upstream.requests_for(Command::FetchByCode);
    let Request::FetchByCode(request) = &fetches[0].1 else {
        panic!("expected a fetch request");
    };
    // Revision comes from the market's revision map.
    assert_eq!(request.revision, 1);
    assert_eq!(connection.pending_requests(), 0);
}

#[tokio::test]
async fn test_fetch_without_projection_returns_every_field() {
    let upstream = FakeUpstream::start().await;
    let (connection, _events) = bootstrapped(&upstream).await;

    let result = connection
        .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
        .await
        .unwrap();
    assert_eq!(result.records[0].fields.len(), 6);
}

#[tokio::test]
async fn test_fetch_by_time_and_range() {
    let upstream = FakeUpstream::start().await;
    let (connection, _events) = bootstrapped(&upstream).await;
    let markets = vec!["DCE".to_string()];

    let at = connection
        .fetch_by_time(
            &markets,
            &["i2409".to_string(), "m2409".to_string()],
            42,
            FetchOptions::new("SampleQuote").fields(["close"]),
        )
        .await
        .unwrap();
    assert_eq!(at.count, 2);
    assert!(at.records.iter().all(|r| r.time_tag == 42));

    let range = connection
        .fetch_by_time_range(
            &markets,
            &["i2409".to_string()],
            FetchOptions::new("SampleQuote").range(0, 10),
        )
        .await
        .unwrap();
    assert_eq!(range.count, 1);

    let ranges = upstream.requests_for(Command::FetchByTimeRange);
    let Request::FetchByTimeRange(request) = &ranges[0].1 else {
        panic!("expected a range request");
    };
    assert_eq!((request.from_time_tag, request.to_time_tag), (0, 10));
}

#[tokio::test]
async fn test_server_error_fails_only_that_request() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::FetchByCode(fetch) if fetch.code == "bad" => {
            vec![Reply::error(Command::FetchByCode, seq, 9, "unknown qualified name")]
        }
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let (connection, _events) = bootstrapped(&upstream).await;

    let failed = connection
        .fetch_by_code("DCE", "bad", FetchOptions::new("SampleQuote"))
        .await;
    match failed {
        Err(GatewayError::Server { code, message }) => {
            assert_eq!(code, 9);
            assert_eq!(message, "unknown qualified name");
        }
        other => panic!("expected server error, got {other:?}"),
    }

    let ok = connection
        .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
        .await
        .unwrap();
    assert_eq!(ok.count, 3);
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_market_without_revisions_is_ready_immediately() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::UniverseRevision => vec![Reply::ok(
            Command::UniverseRevision,
            seq,
            ResponsePayload::Records(vec![market_row("DCE", &[])]),
        )],
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let (connection, _events) = bootstrapped(&upstream).await;

    assert!(upstream.requests_for(Command::UniverseSeeds).is_empty());
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_failed_seeds_response_still_completes_bootstrap() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::UniverseRevision => vec![Reply::ok(
            Command::UniverseRevision,
            seq,
            ResponsePayload::Records(vec![market_row(
                "DCE",
                &[("SampleQuote", 1), ("SampleBar", 1)],
            )]),
        )],
        Request::UniverseSeeds(seeds) if seeds.qualified_name == "SampleBar" => {
            vec![Reply::error(Command::UniverseSeeds, seq, 9, "no such shape")]
        }
        Request::UniverseSeeds(seeds) => vec![Reply::ok(
            Command::UniverseSeeds,
            seq,
            ResponsePayload::Records(vec![
                quote_row(&seeds.market, "i2409", 0),
                quote_row(&seeds.market, "m2409", 0),
            ]),
        )],
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let (connection, _events) = bootstrapped(&upstream).await;

    assert_eq!(upstream.requests_for(Command::UniverseSeeds).len(), 2);
    let securities = connection.securities();
    let codes: Vec<&str> = securities
        .market("DCE")
        .unwrap()
        .iter()
        .map(|entry| entry.code.as_str())
        .collect();
    assert_eq!(codes, ["i2409", "m2409"]);
}

#[tokio::test]
async fn test_bootstrap_error_rejects_connect() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::UniverseRevision => {
            vec![Reply::error(Command::UniverseRevision, seq, 6, "token expired")]
        }
        _ => Vec::new(),
    }))
    .await;
    let (connection, _events) = connection(ConnectionSettings::default());

    let result = timeout(WAIT, connection.connect(&upstream.url(), &Token::new(TOKEN)))
        .await
        .unwrap();
    assert!(matches!(result, Err(GatewayError::Server { code: 6, .. })));
    assert_eq!(connection.state(), ConnectionState::Failed);
}

#[tokio::test]
async fn test_disconnect_rejects_pending_requests() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::FetchByCode(_) => Vec::new(),
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let (connection, _events) = bootstrapped(&upstream).await;

    let fetching = {
        let connection = Arc::clone(&connection);
        tokio::spawn(async move {
            connection
                .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
                .await
        })
    };
    wait_for_requests(&upstream, Command::FetchByCode, 1).await;
    assert_eq!(connection.pending_requests(), 1);

    connection.disconnect().await;

    let result = timeout(WAIT, fetching).await.unwrap().unwrap();
    assert!(matches!(result, Err(GatewayError::ConnectionClosed)));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.pending_requests(), 0);
}

#[tokio::test]
async fn test_request_timeout_abandons_pending_entry() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::FetchByCode(_) => Vec::new(),
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let settings = ConnectionSettings {
        request_timeout: Duration::from_millis(200),
        ..ConnectionSettings::default()
    };
    let (connection, _events) = connection(settings);
    connection
        .connect(&upstream.url(), &Token::new(TOKEN))
        .await
        .unwrap();
    connection.wait_seeds_loaded().await.unwrap();

    let result = connection
        .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
        .await;
    assert!(matches!(result, Err(GatewayError::Timeout(_))));
    assert_eq!(connection.pending_requests(), 0);
    assert!(connection.is_ready());
}

#[tokio::test]
async fn test_upstream_close_after_ready_moves_to_closed() {
    let upstream = FakeUpstream::start().await;
    let (connection, events) = bootstrapped(&upstream).await;
    let mut lifecycle = events.lifecycle_rx();

    upstream.close_sessions();

    let disconnected = timeout(WAIT, async {
        loop {
            if let Ok(LifecycleEvent::Disconnected { connection }) = lifecycle.recv().await {
                break connection;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(disconnected, 1);
    assert_eq!(connection.state(), ConnectionState::Closed);

    // No automatic reconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.handshake_tokens().len(), 1);
    let result = connection
        .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
        .await;
    assert!(matches!(result, Err(GatewayError::NotReady(_))));
}

#[tokio::test]
async fn test_market_status_push_is_surfaced_as_event() {
    let upstream = FakeUpstream::start().await;
    let (_connection, events) = bootstrapped(&upstream).await;
    let mut lifecycle = events.lifecycle_rx();

    let status = MarketStatus {
        market: "DCE".to_string(),
        trade_day: 20_250_101,
        state: MarketState::Open,
        time_tag: 90_000,
    };
    upstream.push(Reply::ok(
        Command::MarketStatus,
        0,
        ResponsePayload::MarketStatus(status.clone()),
    ));

    let received = timeout(WAIT, async {
        loop {
            if let Ok(LifecycleEvent::MarketStatus { status, .. }) = lifecycle.recv().await {
                break status;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, status);
}

#[tokio::test]
async fn test_response_with_untracked_sequence_id_is_dropped() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::FetchByCode(fetch) => vec![
            Reply::ok(
                Command::FetchByCode,
                seq + 1_000,
                ResponsePayload::Records(vec![quote_row(&fetch.market, &fetch.code, 99)]),
            ),
            Reply::ok(
                Command::FetchByCode,
                seq,
                ResponsePayload::Records(vec![quote_row(&fetch.market, &fetch.code, 1)]),
            ),
        ],
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let (connection, _events) = bootstrapped(&upstream).await;

    let result = timeout(
        WAIT,
        connection.fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.count, 1);
    assert_eq!(result.records[0].time_tag, 1);
    assert_eq!(connection.pending_requests(), 0);
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_confirmation_for_unknown_subscription_creates_no_state() {
    let upstream = FakeUpstream::start().await;
    let (connection, _events) = bootstrapped(&upstream).await;

    upstream.push(Reply::ok(
        Command::Subscribe,
        9_999,
        ResponsePayload::Subscribed {
            subscription_id: SubscriptionId::new("never-requested"),
        },
    ));

    // A fetch after the stray frame proves it was processed and dropped.
    let result = timeout(
        WAIT,
        connection.fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote")),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.count, 3);
    assert_eq!(connection.subscription_count(), 0);
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_requests_racing_upstream_close_fail_fast() {
    let upstream = FakeUpstream::with_responder(responder(|seq, request| match request {
        Request::FetchByCode(_) => Vec::new(),
        _ => (common::default_responder())(seq, request),
    }))
    .await;
    let (connection, _events) = bootstrapped(&upstream).await;

    let spawn_fetches = |count: usize| {
        (0..count)
            .map(|_| {
                let connection = Arc::clone(&connection);
                tokio::spawn(async move {
                    connection
                        .fetch_by_code("DCE", "i2409", FetchOptions::new("SampleQuote"))
                        .await
                })
            })
            .collect::<Vec<_>>()
    };

    let mut fetches = spawn_fetches(8);
    wait_for_requests(&upstream, Command::FetchByCode, 8).await;
    upstream.close_sessions();
    fetches.extend(spawn_fetches(32));

    // The request timeout is far longer than the wait, so any request left
    // queued behind the dead session would hang here.
    for fetch in fetches {
        let result = timeout(WAIT, fetch)
            .await
            .expect("request outlived its session")
            .unwrap();
        assert!(
            matches!(
                result,
                Err(GatewayError::ConnectionClosed | GatewayError::NotReady(_))
            ),
            "unexpected result: {result:?}"
        );
    }
    assert_eq!(connection.pending_requests(), 0);
}
