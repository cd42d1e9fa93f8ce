//! End-to-end behavior of the fan-out and packing pipeline through the
//! public API.

use std::sync::Arc;
use std::time::Duration;

use rowsync::config::Config;
use rowsync::dump::DumpWriter;
use rowsync::error::Error;
use rowsync::queue::{APPEND_TIMEOUT, QUEUE_CAPACITY, Queue, QueueMap};
use rowsync::sql::SqlTemplater;

fn templater() -> SqlTemplater {
    let config = Config {
        sync_table_name: "bus_authorized".to_string(),
        sync_columns: "id,$name,count".to_string(),
        ..Config::default()
    };
    SqlTemplater::new(&config).unwrap()
}

fn row(id: u32, name: &str, count: u32) -> Vec<String> {
    vec![id.to_string(), name.to_string(), count.to_string()]
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn notify_fan_out_reaches_connected_clients_only() {
    let map = QueueMap::new();
    let (x, mut x_drain) = Queue::new("X");
    let (y, mut y_drain) = Queue::new("Y");
    map.add(x).await;
    map.add(y).await;

    let record = row(42, "answer", 1);
    map.fan_out(&record).await;

    // A session arriving after the fan-out sees nothing from it; its data
    // comes from its own full sync.
    let (z, mut z_drain) = Queue::new("Z");
    map.add(z).await;

    let got_x = x_drain
        .retrieve_timeout(Duration::from_millis(10))
        .await
        .unwrap();
    let got_y = y_drain
        .retrieve_timeout(Duration::from_millis(10))
        .await
        .unwrap();
    let got_z = z_drain
        .retrieve_timeout(Duration::from_millis(10))
        .await
        .unwrap();

    assert_eq!(got_x, vec![record.clone()]);
    assert_eq!(got_y, vec![record]);
    assert!(got_z.is_empty());
}

#[tokio::test(start_paused = true)]
async fn undrained_session_is_dropped_after_a_burst() {
    let map = QueueMap::new();
    let (x, _x_drain) = Queue::new("X");
    map.add(Arc::clone(&x)).await;

    // A burst larger than the queue capacity with nobody draining: the
    // overflowing append times out after a second and closes the queue.
    for i in 0..=QUEUE_CAPACITY {
        map.fan_out(&row(i as u32, "burst", 0)).await;
    }

    assert!(x.is_closed());
    settle().await;
    assert!(map.get("X").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn overflow_append_returns_within_the_drop_deadline() {
    let (queue, _drain) = Queue::new("X");
    for i in 0..QUEUE_CAPACITY {
        queue.append(row(i as u32, "fill", 0)).await;
    }

    let started = tokio::time::Instant::now();
    queue.append(row(0, "overflow", 0)).await;
    assert!(started.elapsed() <= APPEND_TIMEOUT);
    assert!(queue.is_closed());
}

#[tokio::test]
async fn reconnect_supersedes_the_previous_session() {
    let map = QueueMap::new();
    let (old, mut old_drain) = Queue::new("X");
    map.add(old).await;

    // Same identity reconnects: the new session registers a fresh queue.
    let (new, mut new_drain) = Queue::new("X");
    map.add(Arc::clone(&new)).await;

    let err = old_drain
        .retrieve_timeout(Duration::from_millis(10))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::QueueClosed));

    settle().await;
    let current = map.get("X").await.unwrap();
    assert!(Arc::ptr_eq(&current, &new));

    // Fan-outs now reach only the new session.
    map.fan_out(&row(1, "fresh", 1)).await;
    let got = new_drain
        .retrieve_timeout(Duration::from_millis(10))
        .await
        .unwrap();
    assert_eq!(got.len(), 1);
}

#[tokio::test]
async fn snapshot_packs_into_bounded_statements_in_order() {
    let sql = templater();
    let dir = tempfile::tempdir().unwrap();

    let mut writer = DumpWriter::create_in(dir.path()).await.unwrap();
    for i in 0..500u32 {
        writer.push(&row(i, &"n".repeat(64), i * 2)).await.unwrap();
    }
    let mut dump = writer.finish().await.unwrap();

    let mut statements = Vec::new();
    loop {
        let (stmt, end) = sql.client_insert_dump(&mut dump, 4096).await.unwrap();
        if let Some(stmt) = stmt {
            assert!(stmt.len() <= 4096);
            statements.push(stmt);
        }
        if end {
            break;
        }
    }
    dump.close().await.unwrap();
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

    assert!(statements.len() > 1);

    // Every id appears exactly once, in input order, across statements.
    let mut next_id = 0u32;
    for stmt in &statements {
        let values = stmt
            .split(" VALUES ")
            .nth(1)
            .unwrap()
            .split(" ON DUPLICATE KEY UPDATE ")
            .next()
            .unwrap();
        for tuple in values.split("),(") {
            let id: u32 = tuple
                .trim_start_matches('(')
                .split(',')
                .next()
                .unwrap()
                .parse()
                .unwrap();
            assert_eq!(id, next_id);
            next_id += 1;
        }
    }
    assert_eq!(next_id, 500);
}
