mod support;

use std::time::Duration;

use elva::{api, Pool, Request};
use support::server::{self, ok_response};
use support::{count_connects, drain_events, recorder};

async fn echo_server() -> server::Server {
    server::start(|_, mut conn| async move {
        loop {
            if conn.read_request().await.is_empty() {
                break;
            }
            conn.write(ok_response("pooled").as_bytes()).await;
        }
    })
    .await
}

#[tokio::test]
async fn sequential_requests_reuse_one_member() {
    let server = echo_server().await;
    let pool = Pool::builder()
        .connections(4)
        .build(server.origin())
        .unwrap();

    for _ in 0..3 {
        let res = api::request(&pool, Request::get("/")).await.unwrap();
        assert_eq!(&res.body[..], b"pooled");
    }

    // An idle member is always preferred, so one connection serves all.
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn concurrent_requests_spread_over_members() {
    let server = server::start(|_, mut conn| async move {
        loop {
            if conn.read_request().await.is_empty() {
                break;
            }
            // Stall long enough that the member stays busy while the next
            // request arrives.
            tokio::time::sleep(Duration::from_millis(100)).await;
            conn.write(ok_response("pooled").as_bytes()).await;
        }
    })
    .await;

    let pool = Pool::builder()
        .connections(3)
        .build(server.origin())
        .unwrap();

    let (a, b, c) = tokio::join!(
        api::request(&pool, Request::get("/")),
        api::request(&pool, Request::get("/")),
        api::request(&pool, Request::get("/")),
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    assert_eq!(server.connections(), 3);
}

#[tokio::test]
async fn pool_forwards_member_events() {
    let server = echo_server().await;
    let pool = Pool::new(server.origin()).unwrap();
    let mut events = pool.subscribe();

    let res = api::request(&pool, Request::get("/")).await.unwrap();
    assert_eq!(res.status, 200);

    tokio::time::sleep(Duration::from_millis(50)).await;
    let events = drain_events(&mut events);
    assert_eq!(count_connects(&events), 1);
}

#[tokio::test]
async fn pool_counters_aggregate_members() {
    let server = server::start(|_, conn| async move {
        conn.hold().await;
    })
    .await;

    let pool = Pool::builder()
        .connections(2)
        .build(server.origin())
        .unwrap();

    let (rec1, _probe1) = recorder();
    let (rec2, _probe2) = recorder();
    pool.dispatch(Request::get("/"), rec1);
    pool.dispatch(Request::get("/"), rec2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.size(), 2);
    assert_eq!(pool.running(), 2);
    assert_eq!(pool.connected(), 2);

    pool.destroy(None).await;
    assert_eq!(pool.size(), 0);
}

#[tokio::test]
async fn pool_close_rejects_new_work() {
    let server = echo_server().await;
    let pool = Pool::new(server.origin()).unwrap();

    let res = api::request(&pool, Request::get("/")).await.unwrap();
    assert_eq!(res.status, 200);

    pool.close().await;

    let (rec, mut probe) = recorder();
    pool.dispatch(Request::get("/"), rec);
    probe.expect_error("UND_ERR_CLOSED").await;
}
