//! Routing E2E Test Suite
//!
//! Drives [`ShardRouter`](crate::routing::ShardRouter)s of several nodes
//! that reach each other over the loopback transport, so every remote call
//! goes through signing, verification and the RPC handler.
//!
//! | Test ID    | Scenario                          | Verification                         |
//! |------------|-----------------------------------|--------------------------------------|
//! | TC_RTE_01  | Remote put/get/delete             | Record lands on the owning shard     |
//! | TC_RTE_02  | Scatter-gather with a slow shard  | 4 results plus 1 timeout error       |
//! | TC_RTE_03  | Scatter-gather with a dead shard  | Per-shard transport error            |
//! | TC_RTE_04  | Health feeds routing              | Unhealthy shards are not contacted   |
//! | TC_RTE_05  | Namespace query and pagination    | Paging applies to the merged union   |

#[cfg(test)]
mod tests {
    use crate::error::{Error, ErrorKind};
    use crate::health::HealthStatus;
    use crate::routing::{apply_pagination, merge_results, MergedResult, RouterConfig};
    use crate::testing::{test_urn, TestCluster};
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::{Duration, Instant};

    fn seed_one_per_shard(cluster: &TestCluster, shards: usize) {
        for i in 0..shards {
            let id = TestCluster::shard_id(i);
            cluster
                .store(&id)
                .insert_raw(&test_urn("acme", i as u32).to_string(), json!({ "from": id }));
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_remote_put_get_delete() {
        let cluster = TestCluster::new(3);
        let router = cluster.nodes[0].router();

        // Find a urn owned by some other shard.
        let urn = (0..1000)
            .map(|n| test_urn("acme", n))
            .find(|u| cluster.owner_of(u) != "shard_001")
            .unwrap();
        let owner = cluster.owner_of(&urn);

        router.put(&urn, json!({"total": 42})).await.unwrap();
        assert_eq!(cluster.store(&owner).get_raw(&urn.to_string()), Some(json!({"total": 42})));
        assert!(cluster.store("shard_001").is_empty());

        // Any node reaches the same owner.
        let value = cluster.nodes[2].router().get(&urn).await.unwrap();
        assert_eq!(value, json!({"total": 42}));

        router.del(&urn).await.unwrap();
        assert!(matches!(router.get(&urn).await, Err(Error::NotFound(_))));

        let stats = router.statistics();
        assert_eq!(stats.remote_requests, 3);
        assert_eq!(stats.errors, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_scatter_gather_isolates_slow_shard() {
        let cluster = TestCluster::with_config(5, |config| {
            config.with_router_config(
                RouterConfig::default().with_scatter_timeout(Duration::from_millis(200)),
            )
        });
        seed_one_per_shard(&cluster, 5);
        cluster.set_delay("shard_005", Duration::from_secs(2));

        let start = Instant::now();
        let results = cluster.nodes[0]
            .router()
            .scatter_gather("FOR d IN orders RETURN d")
            .await;
        assert!(start.elapsed() < Duration::from_secs(1));

        assert_eq!(results.len(), 5);
        let ids: Vec<_> = results.iter().map(|r| r.shard_id.as_str()).collect();
        assert_eq!(ids, ["shard_001", "shard_002", "shard_003", "shard_004", "shard_005"]);

        let merged = merge_results(&results);
        assert_eq!(merged.success_count, 4);
        assert_eq!(merged.error_count, 1);
        assert!(merged.is_partial_failure());
        assert_eq!(merged.results.len(), 4);
        assert_eq!(merged.errors[0].shard_id, "shard_005");
        assert_eq!(merged.errors[0].kind, ErrorKind::Timeout);
    }

    #[test_log::test(tokio::test)]
    async fn test_scatter_gather_reports_dead_shard() {
        let cluster = TestCluster::new(3);
        seed_one_per_shard(&cluster, 3);
        cluster.set_down("shard_002", true);

        let value = cluster.nodes[0]
            .router()
            .execute_query("FOR d IN orders RETURN d")
            .await
            .unwrap();
        let merged: MergedResult = serde_json::from_value(value).unwrap();
        assert_eq!(merged.shard_count, 3);
        assert_eq!(merged.success_count, 2);
        assert_eq!(merged.errors.len(), 1);
        assert_eq!(merged.errors[0].kind, ErrorKind::Transport);
        assert_eq!(cluster.nodes[0].metrics().scatter_fanout.snapshot().count, 1);
    }

    #[test_log::test(tokio::test)]
    async fn test_health_check_removes_dead_shard_from_fan_out() {
        let cluster = TestCluster::new(3);
        seed_one_per_shard(&cluster, 3);
        cluster.set_down("shard_003", true);

        let node = &cluster.nodes[0];
        let health = node.cluster_health().await;
        assert_eq!(health.shard("shard_003").unwrap().status, HealthStatus::Critical);
        assert_eq!(health.shard("shard_002").unwrap().status, HealthStatus::Healthy);
        assert!(health.has_quorum);

        let results = node.router().scatter_gather("FOR d IN orders RETURN d").await;
        let contacted: HashSet<_> = results.iter().map(|r| r.shard_id.clone()).collect();
        assert_eq!(contacted.len(), 2);
        assert!(!contacted.contains("shard_003"));
        assert!(results.iter().all(|r| r.is_success()));

        cluster.set_down("shard_003", false);
        node.cluster_health().await;
        assert_eq!(node.router().scatter_gather("FOR d IN orders RETURN d").await.len(), 3);
    }

    #[test_log::test(tokio::test)]
    async fn test_namespace_query_and_pagination_over_union() {
        let cluster = TestCluster::new(3);
        for n in 0..30u32 {
            let namespace = if n % 3 == 0 { "emea" } else { "apac" };
            let urn = test_urn(namespace, n);
            cluster.nodes[0]
                .router()
                .put(&urn, json!({ "n": n, "ns": namespace }))
                .await
                .unwrap();
        }

        let value = cluster.nodes[1]
            .router()
            .execute_query("FOR d IN orders NAMESPACE emea RETURN d")
            .await
            .unwrap();
        let merged: MergedResult = serde_json::from_value(value).unwrap();
        assert_eq!(merged.success_count, 3);
        assert_eq!(merged.results.len(), 10);
        assert!(merged.results.iter().all(|r| r["ns"] == "emea"));

        let page = apply_pagination(merged, 8, 5);
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.total_count, Some(10));

        let joined = cluster.nodes[2]
            .router()
            .execute_cross_shard_join("FOR o IN orders FOR c IN customers JOIN c RETURN o", "customer_id")
            .await
            .unwrap();
        assert_eq!(joined.results.len(), 30);
    }
}
