// SPDX-License-Identifier: LGPL-2.1-or-later
//
// This file is part of redqueue.
//
// redqueue is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// redqueue is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with redqueue. If not, see <https://www.gnu.org/licenses/>.

//! Stats collector tests.

mod common;

use common::TestConsumer;
use redqueue::{Connection, InMemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const POLL: Duration = Duration::from_millis(1);

async fn open_test_connection(tag: &str, store: &InMemoryStore) -> Connection {
    let (errors_tx, _errors_rx) = mpsc::channel(64);
    Connection::open_with_store(tag, Arc::new(store.clone()), errors_tx)
        .await
        .unwrap()
}

#[tokio::test]
async fn test_collect_stats() {
    let store = InMemoryStore::new();

    let observer = open_test_connection("stats-conn", &store).await;
    let conn1 = open_test_connection("stats-conn1", &store).await;
    let conn2 = open_test_connection("stats-conn2", &store).await;

    // q1 only has a ready delivery.
    let q1 = conn2.open_queue("stats-q1").await.unwrap();
    q1.publish(&["stats-d1"]).await.unwrap();

    // q2 is being consumed by conn2 with two consumers: three deliveries
    // fetched, one acked, one rejected, one still unacked.
    let q2 = conn2.open_queue("stats-q2").await.unwrap();
    let consumer = TestConsumer::new(false, true);
    q2.start_consuming(10, POLL).await.unwrap();
    q2.add_consumer("stats-cons1", consumer.clone()).await.unwrap();
    q2.publish(&["stats-d2", "stats-d3", "stats-d4"]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let deliveries = consumer.deliveries();
    assert_eq!(deliveries.len(), 3);
    deliveries[0].ack().await.unwrap();
    deliveries[1].reject().await.unwrap();
    q2.add_consumer("stats-cons2", TestConsumer::new(false, true))
        .await
        .unwrap();

    let queues = observer.get_open_queues().await.unwrap();
    let stats = observer.collect_stats(&queues).await.unwrap();

    let q1_stat = &stats.queue_stats["stats-q1"];
    assert_eq!(q1_stat.ready_count, 1);
    assert_eq!(q1_stat.rejected_count, 0);
    assert_eq!(q1_stat.unacked_count(), 0);
    assert_eq!(q1_stat.consumer_count(), 0);

    let q2_stat = &stats.queue_stats["stats-q2"];
    assert_eq!(q2_stat.ready_count, 0);
    assert_eq!(q2_stat.rejected_count, 1);
    assert_eq!(q2_stat.unacked_count(), 1);
    assert_eq!(q2_stat.consumer_count(), 2);

    // The per-connection breakdown names conn2.
    let conn2_stat = &q2_stat.connection_stats[conn2.name()];
    assert_eq!(conn2_stat.unacked_count, 1);
    assert_eq!(conn2_stat.consumer_count, 2);

    // conn1 is live but idle: zero rows, not missing data.
    let conn1_stat = &q2_stat.connection_stats[conn1.name()];
    assert_eq!(conn1_stat.unacked_count, 0);
    assert_eq!(conn1_stat.consumer_count, 0);

    // Restricting the queue list restricts the report.
    let stats = observer
        .collect_stats(&["stats-q1".to_string()])
        .await
        .unwrap();
    assert_eq!(stats.queue_stats.len(), 1);
    assert!(stats.queue_stats.contains_key("stats-q1"));

    // The report serializes for external rendering.
    let json = stats.to_json().unwrap();
    assert!(json.contains("stats-q1"));
    assert!(json.contains("ready_count"));

    q2.stop_consuming().await.unwrap();
    observer.stop_heartbeat().await.unwrap();
    conn1.stop_heartbeat().await.unwrap();
    conn2.stop_heartbeat().await.unwrap();
}

#[tokio::test]
async fn test_stats_exclude_stale_connections() {
    let store = InMemoryStore::new();

    let stale = open_test_connection("stale-conn", &store).await;
    let queue = stale.open_queue("stale-q").await.unwrap();
    queue.publish(&["stale-d1", "stale-d2"]).await.unwrap();
    queue.start_consuming(2, POLL).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.unacked_count().await.unwrap(), 2);

    queue.stop_consuming().await.unwrap();
    stale.stop_heartbeat().await.unwrap();

    let observer = open_test_connection("stale-observer", &store).await;
    let stats = observer
        .collect_stats(&["stale-q".to_string()])
        .await
        .unwrap();

    // The dead connection's unacked deliveries are invisible to stats; the
    // cleaner, not the reporter, deals with them.
    let stat = &stats.queue_stats["stale-q"];
    assert_eq!(stat.ready_count, 0);
    assert_eq!(stat.unacked_count(), 0);
    assert!(!stat.connection_stats.contains_key(stale.name()));

    observer.stop_heartbeat().await.unwrap();
}
