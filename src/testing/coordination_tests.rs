//! End-to-end tests for the request coordination paths: owner
//! resolution, per-owner splitting, rejection retry, redistribution
//! waits, and partial-result handling, all against the mock cluster.

#[cfg(test)]
mod tests {
    use crate::error::{Error, PartialResult};
    use crate::message::{KeyOp, KeySetOp, RequestBody};
    use crate::partition::PartitionSet;
    use crate::testing::MockCluster;
    use crate::types::{Key, NodeId, Value};
    use bytes::Bytes;
    use std::time::Duration;

    fn key(text: &str) -> Key {
        Bytes::from(text.to_owned())
    }

    fn value(text: &str) -> Value {
        Bytes::from(text.to_owned())
    }

    /// A key whose partition is currently owned by the given node.
    fn key_owned_by(cluster: &MockCluster, node: NodeId, tag: &str) -> Key {
        for i in 0..10_000 {
            let k = key(&format!("{tag}-{i}"));
            if cluster.owner_of(&k) == Some(node) {
                return k;
            }
        }
        panic!("no key hashes to a partition of node {node}");
    }

    fn partition_of(cluster: &MockCluster, key: &Key) -> PartitionSet {
        use crate::ownership::OwnershipView;
        PartitionSet::from_iter(
            cluster.directory.partition_count(),
            [cluster.directory.partition_of(key)],
        )
    }

    #[tokio::test]
    async fn test_put_get_remove_roundtrip() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("prices");

        assert_eq!(cache.get(key("a")).await.unwrap(), None);
        assert_eq!(cache.put(key("a"), value("1")).await.unwrap(), None);
        assert_eq!(cache.get(key("a")).await.unwrap(), Some(value("1")));
        assert_eq!(
            cache.put(key("a"), value("2")).await.unwrap(),
            Some(value("1"))
        );
        assert_eq!(cache.remove(key("a")).await.unwrap(), Some(value("2")));
        assert_eq!(cache.get(key("a")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_contains_key_and_value() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        cache.put(key("k"), value("v")).await.unwrap();
        assert!(cache.contains_key(key("k")).await.unwrap());
        assert!(!cache.contains_key(key("other")).await.unwrap());
        assert!(cache.contains_value(value("v")).await.unwrap());
        assert!(!cache.contains_value(value("missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_all_splits_per_owner_and_self_goes_last() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let local = key_owned_by(&cluster, 1, "l");
        let remote = key_owned_by(&cluster, 2, "r");
        cluster.seed([
            (local.clone(), value("lv")),
            (remote.clone(), value("rv")),
        ]);

        let map = cache
            .get_all(vec![local.clone(), remote.clone(), key("absent")])
            .await
            .unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&local), Some(&value("lv")));
        assert_eq!(map.get(&remote), Some(&value("rv")));

        // both owners polled once, with the local sub-request last
        let polled = cluster.transport.polled_nodes();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled.last(), Some(&1));
    }

    #[tokio::test]
    async fn test_put_all_and_size() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let entries: Vec<(Key, Value)> = (0..40)
            .map(|i| (key(&format!("k{i}")), value(&format!("v{i}"))))
            .collect();
        cache.put_all(entries.clone()).await.unwrap();

        assert_eq!(cache.size().await.unwrap(), 40);
        assert!(!cache.is_empty().await.unwrap());
        for (k, v) in entries.iter().take(5) {
            assert_eq!(cache.get(k.clone()).await.unwrap(), Some(v.clone()));
        }

        cache.clear().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_truncate_empties_every_partition() {
        let cluster = MockCluster::new(8, &[1, 2, 3]);
        let cache = cluster.cache("c");

        cache
            .put_all((0..30).map(|i| (key(&format!("k{i}")), value("x"))).collect())
            .await
            .unwrap();
        cache.truncate().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_single_key_rejection_is_retried_transparently() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k = key_owned_by(&cluster, 2, "k");
        cluster.seed([(k.clone(), value("v"))]);
        cluster
            .transport
            .reject_once(2, partition_of(&cluster, &k));

        // first attempt is rejected; the retry after the trickle tick wins
        assert_eq!(cache.get(k.clone()).await.unwrap(), Some(value("v")));
        let polls = cluster
            .transport
            .polled_nodes()
            .iter()
            .filter(|n| **n == 2)
            .count();
        assert!(polls >= 2);
    }

    #[tokio::test]
    async fn test_orphaned_partition_waits_for_owner() {
        let cluster = MockCluster::new(4, &[1, 2]);
        let cache = cluster.cache("c");

        let k = key_owned_by(&cluster, 2, "k");
        cluster.seed([(k.clone(), value("v"))]);

        use crate::ownership::OwnershipView;
        let p = cluster.directory.partition_of(&k);
        cluster.directory.set_primary(p, None);

        let directory = cluster.directory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            directory.set_primary(p, Some(2));
        });

        assert_eq!(cache.get(k).await.unwrap(), Some(value("v")));
    }

    #[tokio::test]
    async fn test_keyset_rejection_folds_keys_into_next_round() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k1 = key_owned_by(&cluster, 1, "a");
        let k2 = key_owned_by(&cluster, 2, "b");
        cluster.seed([(k1.clone(), value("1")), (k2.clone(), value("2"))]);
        cluster
            .transport
            .reject_once(2, partition_of(&cluster, &k2));

        let map = cache.get_all(vec![k1.clone(), k2.clone()]).await.unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map.get(&k2), Some(&value("2")));
    }

    #[tokio::test]
    async fn test_redistribution_wait_leaves_owned_partitions_clear() {
        use crate::ownership::OwnershipView;

        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let live = key_owned_by(&cluster, 1, "live");
        let stuck = key_owned_by(&cluster, 2, "stuck");
        cluster.seed([(live.clone(), value("lv")), (stuck.clone(), value("sv"))]);

        let p_live = cluster.directory.partition_of(&live);
        let p_stuck = cluster.directory.partition_of(&stuck);

        // one key orphaned while the assignment is still in flight, so the
        // whole key set rides the redistribution wait
        cluster.directory.set_primary(p_stuck, None);
        cluster.directory.set_assignment_complete(false);

        let directory = cluster.directory.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            directory.set_primary(p_stuck, Some(2));
            directory.set_assignment_complete(true);
        });

        let map = cache
            .get_all(vec![live.clone(), stuck.clone()])
            .await
            .unwrap();
        assert_eq!(map.len(), 2);

        // only the orphaned partition was ever marked contended
        assert!(cluster.slots.is_cleared(p_live));
    }

    #[tokio::test]
    async fn test_put_all_rejected_partitions_retried() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k2 = key_owned_by(&cluster, 2, "w");
        cluster
            .transport
            .reject_once(2, partition_of(&cluster, &k2));

        cache
            .put_all(vec![(k2.clone(), value("v"))])
            .await
            .unwrap();
        assert_eq!(cluster.transport.store_get(2, &k2), Some(value("v")));
    }

    #[tokio::test]
    async fn test_timeout_carries_partial_map() {
        crate::testing::init_logging();
        let cluster = MockCluster::new(16, &[1, 2]);
        let config = crate::GridConfig::new(16)
            .with_request_timeout(Some(Duration::from_millis(200)))
            .with_redistribution_tick(Duration::from_millis(20));
        let cache = cluster.cache_with_config("c", config);

        let k1 = key_owned_by(&cluster, 1, "ok");
        let k2 = key_owned_by(&cluster, 2, "stuck");
        cluster.seed([(k1.clone(), value("1")), (k2.clone(), value("2"))]);
        cluster
            .transport
            .reject_always(2, partition_of(&cluster, &k2));

        let err = cache.get_all(vec![k1.clone(), k2]).await.unwrap_err();
        match err {
            Error::Timeout {
                partial: Some(PartialResult::Map(map)),
            } => {
                assert_eq!(map.get(&k1), Some(&value("1")));
            }
            other => panic!("expected timeout with map partial, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_storage_when_all_members_left() {
        let cluster = MockCluster::new(4, &[1]);
        let cache = cluster.cache("c");

        cluster.directory.publish(vec![None; 4]);
        cluster.directory.set_alive(Vec::new());

        assert!(matches!(
            cache.get(key("k")).await.unwrap_err(),
            Error::NoStorage
        ));
    }

    #[tokio::test]
    async fn test_released_cache_reports_destroyed() {
        let cluster = MockCluster::new(4, &[1]);
        let cache = cluster.cache("c");
        assert!(cache.is_active());

        cache.release();
        assert!(!cache.is_active());
        assert!(matches!(
            cache.get(key("k")).await.unwrap_err(),
            Error::CacheDestroyed
        ));
    }

    #[tokio::test]
    async fn test_stopped_service_reported_over_destroyed() {
        let cluster = MockCluster::new(4, &[1]);
        let cache = cluster.cache("c");

        cache.coordinator().lifecycle().stop();
        assert!(matches!(
            cache.get(key("k")).await.unwrap_err(),
            Error::ServiceStopped
        ));
    }

    #[tokio::test]
    async fn test_lock_unlock_roundtrip() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k = key("locked");
        assert!(cache.lock(k.clone(), 0).await.unwrap());
        assert_eq!(cluster.transport.lock_holder(&k), Some(1));
        assert!(cache.unlock(k.clone()).await.unwrap());
        assert_eq!(cluster.transport.lock_holder(&k), None);
    }

    #[tokio::test]
    async fn test_failed_lock_poll_issues_best_effort_unlock() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k = key_owned_by(&cluster, 2, "lk");
        cluster.transport.fail_polls(2, 1);

        let err = cache.lock(k.clone(), 0).await.unwrap_err();
        assert!(matches!(err, Error::Interrupted));

        // the recovery unlock reached the owner
        let unlock_sent = cluster.transport.polled_requests().iter().any(
            |(node, request)| {
                *node == 2
                    && matches!(
                        request.body,
                        RequestBody::Key {
                            op: KeyOp::Unlock { .. },
                            ..
                        }
                    )
            },
        );
        assert!(unlock_sent);
        assert_eq!(cluster.transport.lock_holder(&k), None);
    }

    #[tokio::test]
    async fn test_remove_all_and_contains_all() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let keys: Vec<Key> = (0..10).map(|i| key(&format!("k{i}"))).collect();
        cache
            .put_all(keys.iter().map(|k| (k.clone(), value("v"))).collect())
            .await
            .unwrap();

        assert!(cache.contains_all(keys.clone()).await.unwrap());
        assert!(!cache
            .contains_all(vec![keys[0].clone(), key("missing")])
            .await
            .unwrap());

        cache.remove_all(keys.clone()).await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_aggregate_keys_returns_per_owner_partials() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k1 = key_owned_by(&cluster, 1, "a");
        let k2 = key_owned_by(&cluster, 2, "b");
        cluster.seed([(k1.clone(), value("1")), (k2.clone(), value("2"))]);

        let partials = cache
            .aggregate_keys(vec![k1, k2], crate::AgentSpec(Bytes::from_static(b"count")))
            .await
            .unwrap();
        // one blob per owner, each counting one present key
        assert_eq!(partials.len(), 2);
        for blob in partials {
            assert_eq!(blob, Value::from(1u64.to_le_bytes().to_vec()));
        }
    }

    #[tokio::test]
    async fn test_listener_registration_rides_request_paths() {
        use crate::listener::{MapEvent, MapListener};
        use std::sync::Arc;

        struct Nop;
        impl MapListener for Nop {
            fn on_event(&self, _event: &MapEvent) {}
        }

        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("c");

        let k = key("watched");
        cache
            .add_key_listener(k.clone(), Arc::new(Nop), false)
            .await
            .unwrap();
        assert!(!cache.listeners().is_empty());

        cache.remove_key_listener(k);
        assert!(cache.listeners().is_empty());
        let posted = cluster.transport.posted_requests();
        assert!(posted.iter().any(|(_, request)| matches!(
            request.body,
            RequestBody::KeySet {
                op: KeySetOp::RemoveListener { .. },
                ..
            }
        )));

        let id = cache
            .add_filter_listener(None, Arc::new(Nop), true)
            .await
            .unwrap();
        assert!(id > 0);
        cache.remove_filter_listener(id).await.unwrap();
        assert!(cache.listeners().is_empty());
    }
}
