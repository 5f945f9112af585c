mod support;

use std::time::Duration;

use elva::{api, Client, ClientEvent, Request};
use support::server::{self, ok_response};
use support::{count_disconnects, drain_events, recorder};

#[tokio::test]
async fn headers_timeout_fails_the_head_request() {
    let server = server::start(|_, conn| async move {
        // Accept the request and never answer.
        conn.hold().await;
    })
    .await;

    let client = Client::builder()
        .headers_timeout(Duration::from_millis(200))
        .build(server.origin())
        .unwrap();

    let (rec, mut probe) = recorder();
    client.dispatch(Request::get("/"), rec);
    probe.expect_error("UND_ERR_HEADERS_TIMEOUT").await;
}

#[tokio::test]
async fn body_timeout_fires_between_chunks() {
    let server = server::start(|_, mut conn| async move {
        conn.read_request().await;
        conn.write(b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nabc")
            .await;
        conn.hold().await;
    })
    .await;

    let client = Client::builder()
        .body_timeout(Duration::from_millis(200))
        .build(server.origin())
        .unwrap();

    let (rec, mut probe) = recorder();
    client.dispatch(Request::get("/"), rec);
    probe.expect_error("UND_ERR_BODY_TIMEOUT").await;
    assert_eq!(probe.state().statuses, vec![200]);
}

#[tokio::test]
async fn per_request_timeout_overrides_client_default() {
    let server = server::start(|_, mut conn| async move {
        conn.read_request().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        conn.write(ok_response("late").as_bytes()).await;
        conn.hold().await;
    })
    .await;

    // The client default would wait for the response; the request's own
    // budget is tighter and wins.
    let client = Client::builder()
        .headers_timeout(Duration::from_secs(30))
        .build(server.origin())
        .unwrap();

    let (rec, mut probe) = recorder();
    client.dispatch(
        Request::get("/").headers_timeout(Duration::from_millis(100)),
        rec,
    );
    probe.expect_error("UND_ERR_HEADERS_TIMEOUT").await;
}

#[tokio::test]
async fn connect_timeout_fails_queued_requests() {
    // A non-routable address: the SYN goes nowhere.
    let client = Client::builder()
        .connect_timeout(Duration::from_millis(200))
        .build("http://10.255.255.1:81")
        .unwrap();

    let (rec1, mut probe1) = recorder();
    let (rec2, mut probe2) = recorder();
    client.dispatch(Request::get("/"), rec1);
    client.dispatch(Request::get("/"), rec2);

    // On oddly routed networks the address is rejected outright, which is
    // a transient socket error and retried instead of failed; give up on
    // asserting there.
    match tokio::time::timeout(Duration::from_secs(2), probe1.terminal()).await {
        Ok(support::Terminal::Error(code)) => {
            assert_eq!(code, "UND_ERR_CONNECT_TIMEOUT");
            probe2.expect_error("UND_ERR_CONNECT_TIMEOUT").await;
        }
        Ok(support::Terminal::Complete) => panic!("request cannot complete"),
        Err(_elapsed) => {
            client.destroy(None).await;
        }
    }
}

#[tokio::test]
async fn idle_connection_expires() {
    let server = server::start(|_, mut conn| async move {
        conn.read_request().await;
        conn.write(ok_response("ok").as_bytes()).await;
        conn.hold().await;
    })
    .await;

    let client = Client::builder()
        .keep_alive_timeout(Duration::from_millis(200))
        .build(server.origin())
        .unwrap();
    let mut events = client.subscribe();

    let res = api::request(&client, Request::get("/")).await.unwrap();
    assert_eq!(res.status, 200);
    assert!(client.connected());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!client.connected());

    let events = drain_events(&mut events);
    assert_eq!(count_disconnects(&events), 1);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Disconnect { code, .. } if *code == "UND_ERR_TIMEOUT"
    )));
}

#[tokio::test]
async fn server_advertised_keep_alive_is_clamped() {
    let server = server::start(|_, mut conn| async move {
        conn.read_request().await;
        // An advertised timeout at or below the safety threshold taints
        // the connection; it closes right after the response.
        conn.write(
            b"HTTP/1.1 200 OK\r\nkeep-alive: timeout=1\r\ncontent-length: 2\r\n\r\nok",
        )
        .await;
        conn.hold().await;
    })
    .await;

    let client = Client::new(server.origin()).unwrap();
    let mut events = client.subscribe();

    let res = api::request(&client, Request::get("/")).await.unwrap();
    assert_eq!(res.status, 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!client.connected());
    let events = drain_events(&mut events);
    assert!(events.iter().any(|e| matches!(
        e,
        ClientEvent::Disconnect { code, .. } if *code == "UND_ERR_INFO"
    )));
}

#[tokio::test]
async fn server_advertised_keep_alive_extends_idle() {
    let server = server::start(|_, mut conn| async move {
        conn.read_request().await;
        conn.write(
            b"HTTP/1.1 200 OK\r\nkeep-alive: timeout=30\r\ncontent-length: 2\r\n\r\nok",
        )
        .await;
        conn.hold().await;
    })
    .await;

    // The client's own default would expire quickly; the server's hint
    // keeps the connection around.
    let client = Client::builder()
        .keep_alive_timeout(Duration::from_millis(100))
        .build(server.origin())
        .unwrap();

    let res = api::request(&client, Request::get("/")).await.unwrap();
    assert_eq!(res.status, 200);

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.connected());
}
