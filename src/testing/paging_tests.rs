//! Tests for the limited-query strategies and the lazy pagers.

#[cfg(test)]
mod tests {
    use crate::paging::LimitFilter;
    use crate::testing::MockCluster;
    use crate::types::{Key, Value};
    use bytes::Bytes;
    use std::collections::HashSet;

    fn seed_keys(cluster: &MockCluster, count: usize) -> HashSet<Key> {
        let entries: Vec<(Key, Value)> = (0..count)
            .map(|i| {
                (
                    Bytes::from(format!("key-{i:04}")),
                    Bytes::from(format!("val-{i:04}")),
                )
            })
            .collect();
        let keys = entries.iter().map(|(k, _)| k.clone()).collect();
        cluster.seed(entries);
        keys
    }

    #[tokio::test]
    async fn test_sequential_pages_partition_the_result_set() {
        crate::testing::init_logging();
        let cluster = MockCluster::new(16, &[1, 2, 3]);
        let cache = cluster.cache("q");
        let all = seed_keys(&cluster, 30);

        let mut filter = LimitFilter::new(7, true);
        let mut seen: HashSet<Key> = HashSet::new();

        for page in 0..20 {
            filter.page = page;
            let keys = cache.query_keys(None, Some(&mut filter)).await.unwrap();
            for k in keys {
                // no duplicates across pages
                assert!(seen.insert(k));
            }
            if filter.cursor().is_none() {
                break;
            }
        }

        // no omissions either
        assert_eq!(seen, all);
    }

    #[tokio::test]
    async fn test_sequential_first_page_is_exact() {
        let cluster = MockCluster::new(16, &[1, 2, 3]);
        let cache = cluster.cache("q");
        seed_keys(&cluster, 30);

        let mut filter = LimitFilter::new(7, true);
        let keys = cache.query_keys(None, Some(&mut filter)).await.unwrap();
        assert_eq!(keys.len(), 7);
        assert!(filter.cursor().is_some());
    }

    #[tokio::test]
    async fn test_sequential_single_owner_exhausts_in_one_scan() {
        let cluster = MockCluster::new(8, &[1]);
        let cache = cluster.cache("q");
        let all = seed_keys(&cluster, 5);

        let mut filter = LimitFilter::new(10, true);
        let keys = cache.query_keys(None, Some(&mut filter)).await.unwrap();
        assert_eq!(keys.into_iter().collect::<HashSet<_>>(), all);
        assert!(filter.cursor().is_none());
    }

    #[tokio::test]
    async fn test_distributed_overshoots_but_covers_the_page() {
        let cluster = MockCluster::new(16, &[1, 2, 3]);
        let cache = cluster.cache("q");
        let all = seed_keys(&cluster, 30);

        let mut filter = LimitFilter::new(10, false);
        let keys = cache.query_keys(None, Some(&mut filter)).await.unwrap();

        // at least a page worth of material for the caller to truncate,
        // all of it distinct and drawn from the real key population
        assert!(keys.len() >= 10);
        let unique: HashSet<Key> = keys.iter().cloned().collect();
        assert_eq!(unique.len(), keys.len());
        for k in &keys {
            assert!(all.contains(k));
        }
    }

    #[tokio::test]
    async fn test_unlimited_query_returns_everything() {
        let cluster = MockCluster::new(16, &[1, 2]);
        let cache = cluster.cache("q");
        let all = seed_keys(&cluster, 25);

        let keys = cache.query_keys(None, None).await.unwrap();
        assert_eq!(keys.into_iter().collect::<HashSet<_>>(), all);

        let entries = cache.query_entries(None, None).await.unwrap();
        assert_eq!(entries.len(), 25);
        for (k, v) in entries {
            assert!(all.contains(&k));
            assert!(!v.is_empty());
        }
    }

    #[tokio::test]
    async fn test_key_pager_drains_every_partition() {
        let cluster = MockCluster::new(16, &[1, 2, 3]);
        let cache = cluster.cache("q");
        let all = seed_keys(&cluster, 40);

        let mut pager = cache.keys();
        let mut seen: HashSet<Key> = HashSet::new();
        let mut pages = 0;
        while let Some(page) = pager.next_page().await.unwrap() {
            for k in page {
                assert!(seen.insert(k));
            }
            pages += 1;
            assert!(pages < 64, "pager failed to terminate");
        }
        assert_eq!(seen, all);
    }

    #[tokio::test]
    async fn test_entry_pager_resolves_values() {
        let cluster = MockCluster::new(8, &[1, 2]);
        let cache = cluster.cache("q");
        seed_keys(&cluster, 12);

        let mut pager = cache.entries();
        let mut total = 0;
        while let Some(page) = pager.next_page().await.unwrap() {
            for (k, v) in page {
                let suffix = &k[4..];
                assert_eq!(&v[4..], suffix);
                total += 1;
            }
        }
        assert_eq!(total, 12);
    }

    #[tokio::test]
    async fn test_query_on_released_cache_fails() {
        let cluster = MockCluster::new(8, &[1]);
        let cache = cluster.cache("q");
        cache.release();
        assert!(cache.query_keys(None, None).await.is_err());
    }
}
