// Copyright 2020 Joyent, Inc.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slog::{o, Drain, Level, LevelFilter, Logger};
use tokio_test::{assert_err, assert_ok};

use tchannel::handler::OutgoingResponse;
use tchannel::peers::SequenceRandom;
use tchannel::{Channel, ChannelOptions, Error, ErrorCode, RetryFlags};

fn test_log() -> Logger {
    let plain = slog_term::PlainSyncDecorator::new(std::io::stdout());
    Logger::root(
        Mutex::new(LevelFilter::new(
            slog_term::FullFormat::new(plain).build(),
            Level::Info,
        ))
        .fuse(),
        o!("build-id" => "0.1.0"),
    )
}

fn options(name: &str) -> ChannelOptions {
    ChannelOptions {
        process_name: name.to_string(),
        timeout_check_interval_ms: 20,
        timeout_fuzz_ms: 10,
        ..ChannelOptions::default()
    }
}

#[derive(Clone, Copy)]
enum Behavior {
    Decline,
    Busy,
    Unexpected,
    BadRequest,
    Stall,
    NotOk,
    Succeed,
}

/// A server whose `flaky::call` endpoint always behaves the same way.
async fn server(behavior: Behavior, log: &Logger) -> (Channel, String) {
    let server = Channel::new(options("flaky-server"), Some(log)).unwrap();
    let addr = server.listen("127.0.0.1:0").await.unwrap().to_string();
    let name = addr.clone();
    server.sub_channel("flaky").register("call", move |_call| {
        let name = name.clone();
        async move {
            match behavior {
                Behavior::Decline => Err(Error::declined("not today")),
                Behavior::Busy => Err(Error::busy("too busy")),
                Behavior::Unexpected => Err(Error::unexpected("handler blew up")),
                Behavior::BadRequest => Err(Error::bad_request("bad args")),
                Behavior::Stall => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(OutgoingResponse::ok("", name))
                }
                Behavior::NotOk => Ok(OutgoingResponse::not_ok("", name)),
                Behavior::Succeed => Ok(OutgoingResponse::ok("", name)),
            }
        }
    });
    (server, addr)
}

async fn servers(behaviors: &[Behavior], log: &Logger) -> Vec<(Channel, String)> {
    let mut all = Vec::new();
    for behavior in behaviors {
        all.push(server(*behavior, log).await);
    }
    all
}

fn client(addrs: &[String], log: &Logger) -> (Channel, tchannel::SubChannel) {
    let client = Channel::new(options("client"), Some(log)).unwrap();
    let flaky =
        client.sub_channel_with_random("flaky", Arc::new(SequenceRandom::new(vec![0.5])));
    for addr in addrs {
        flaky.add_peer(addr);
    }
    (client, flaky)
}

fn shut_down(all: Vec<(Channel, String)>, client: Channel) {
    client.close();
    for (server, _) in all {
        server.close();
    }
}

#[tokio::test]
async fn retries_until_a_peer_succeeds() {
    let log = test_log();
    let all = servers(
        &[
            Behavior::Decline,
            Behavior::Busy,
            Behavior::Unexpected,
            Behavior::Succeed,
        ],
        &log,
    )
    .await;
    let addrs: Vec<String> = all.iter().map(|(_, addr)| addr.clone()).collect();
    let (client, flaky) = client(&addrs, &log);

    let mut req = flaky.request(flaky.request_options().retry_limit(3));
    let res = assert_ok!(req.send("call", "", "").await);
    assert!(res.ok);
    assert_eq!(&res.arg3[..], addrs[3].as_bytes());

    let attempts = req.attempts();
    assert_eq!(attempts.len(), 4);
    let peers: Vec<&str> = attempts.iter().map(|a| a.peer.as_str()).collect();
    assert_eq!(peers, addrs.iter().map(String::as_str).collect::<Vec<_>>());
    assert_eq!(attempts[0].error_code(), Some(ErrorCode::Declined));
    assert_eq!(attempts[1].error_code(), Some(ErrorCode::Busy));
    assert_eq!(attempts[2].error_code(), Some(ErrorCode::Unexpected));
    assert!(attempts[3].outcome.is_ok());

    shut_down(all, client);
}

#[tokio::test]
async fn retry_limit_bounds_attempts() {
    let log = test_log();
    let all = servers(
        &[Behavior::Decline, Behavior::Decline, Behavior::Succeed],
        &log,
    )
    .await;
    let addrs: Vec<String> = all.iter().map(|(_, addr)| addr.clone()).collect();
    let (client, flaky) = client(&addrs, &log);

    let mut req = flaky.request(flaky.request_options().retry_limit(1));
    let e = assert_err!(req.send("call", "", "").await);
    assert_eq!(e.code(), ErrorCode::Declined);
    assert_eq!(req.attempts().len(), 2);

    shut_down(all, client);
}

#[tokio::test]
async fn out_of_peers_surfaces_the_last_error() {
    let log = test_log();
    let all = servers(&[Behavior::Busy, Behavior::Decline], &log).await;
    let addrs: Vec<String> = all.iter().map(|(_, addr)| addr.clone()).collect();
    let (client, flaky) = client(&addrs, &log);

    let mut req = flaky.request(flaky.request_options().retry_limit(5));
    match req.send("call", "", "").await {
        Err(Error::Remote { code, message }) => {
            assert_eq!(code, ErrorCode::Declined);
            assert_eq!(message, "not today");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(req.attempts().len(), 2);

    shut_down(all, client);
}

#[tokio::test]
async fn flags_gate_retries() {
    let log = test_log();
    let all = servers(
        &[Behavior::BadRequest, Behavior::Unexpected, Behavior::Succeed],
        &log,
    )
    .await;
    let addrs: Vec<String> = all.iter().map(|(_, addr)| addr.clone()).collect();

    // bad requests are never retried
    let (client_a, flaky) = client(&addrs, &log);
    let mut req = flaky.request(flaky.request_options());
    let e = assert_err!(req.send("call", "", "").await);
    assert_eq!(e.code(), ErrorCode::BadRequest);
    assert_eq!(req.attempts().len(), 1);

    // unexpected errors only with on_connection_error
    let (client_b, flaky) = client(&addrs[1..], &log);
    let flags = RetryFlags {
        on_connection_error: false,
        ..RetryFlags::default()
    };
    let mut req = flaky.request(flaky.request_options().retry_flags(flags));
    let e = assert_err!(req.send("call", "", "").await);
    assert_eq!(e.code(), ErrorCode::Unexpected);
    assert_eq!(req.attempts().len(), 1);

    let mut req = flaky.request(flaky.request_options());
    assert_ok!(req.send("call", "", "").await);
    assert_eq!(req.attempts().len(), 2);

    client_a.close();
    shut_down(all, client_b);
}

#[tokio::test]
async fn timeouts_move_on_to_the_next_peer() {
    let log = test_log();
    let all = servers(&[Behavior::Stall, Behavior::Succeed], &log).await;
    let addrs: Vec<String> = all.iter().map(|(_, addr)| addr.clone()).collect();
    let (client, flaky) = client(&addrs, &log);

    let mut req = flaky.request(
        flaky
            .request_options()
            .timeout(Duration::from_secs(2))
            .timeout_per_attempt(Duration::from_millis(200)),
    );
    let res = assert_ok!(req.send("call", "", "").await);
    assert_eq!(&res.arg3[..], addrs[1].as_bytes());
    assert_eq!(req.attempts()[0].error_code(), Some(ErrorCode::Timeout));

    let never = RetryFlags {
        never: true,
        ..RetryFlags::default()
    };
    let mut req = flaky.request(
        flaky
            .request_options()
            .timeout_per_attempt(Duration::from_millis(200))
            .retry_flags(never),
    );
    let e = assert_err!(req.send("call", "", "").await);
    assert_eq!(e.code(), ErrorCode::Timeout);
    assert_eq!(req.attempts().len(), 1);

    shut_down(all, client);
}

#[tokio::test]
async fn application_retry_hook() {
    let log = test_log();
    let all = servers(&[Behavior::NotOk, Behavior::Succeed], &log).await;
    let addrs: Vec<String> = all.iter().map(|(_, addr)| addr.clone()).collect();

    // without a hook a not-ok response is final
    let (client_a, flaky) = client(&addrs, &log);
    let mut req = flaky.request(flaky.request_options());
    let res = assert_ok!(req.send("call", "", "").await);
    assert!(!res.ok);
    assert_eq!(req.attempts().len(), 1);

    let (client_b, flaky) = client(&addrs, &log);
    let mut req = flaky.request(flaky.request_options().should_application_retry(|res| !res.ok));
    let res = assert_ok!(req.send("call", "", "").await);
    assert!(res.ok);
    assert_eq!(&res.arg3[..], addrs[1].as_bytes());
    assert_eq!(req.attempts().len(), 2);

    client_a.close();
    shut_down(all, client_b);
}
