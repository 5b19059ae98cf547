//! Tests for connection pooling

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map};
    use tokio_test::{assert_err, assert_ok};

    use crate::core::{ServedBy, ToolCallRequest};
    use crate::pool::{ConnectionPool, PoolConfig};
    use crate::testing::StubToolServer;
    use crate::EnhancedClient;
    use error_handling_rs::{ErrorKind, ToolError};

    fn pool(size: usize) -> ConnectionPool {
        ConnectionPool::new(PoolConfig {
            max_connections: size,
            acquire_timeout: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn test_acquire_beyond_capacity_is_pool_exhausted() {
        let pool = pool(2);
        pool.register(StubToolServer::shared("primary"));

        let first = assert_ok!(pool.acquire("primary").await);
        let second = assert_ok!(pool.acquire("primary").await);
        let err = assert_err!(pool.acquire("primary").await);
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        match err {
            ToolError::PoolExhausted { server_id, waited_ms } => {
                assert_eq!(server_id, "primary");
                assert!(waited_ms >= 40);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        pool.release(first);
        let third = assert_ok!(pool.acquire("primary").await);
        drop((second, third));

        let stats = &pool.stats()[0];
        assert_eq!(stats.created, 2);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.idle, 2);
    }

    #[tokio::test]
    async fn test_released_slots_are_reused() {
        let server = StubToolServer::shared("primary");
        let pool = pool(4);
        pool.register(server.clone());

        for _ in 0..5 {
            let conn = assert_ok!(pool.acquire("primary").await);
            assert!(conn.slot().unwrap().in_use());
            assert_ok!(conn.call("list_products", &Map::new()).await);
            pool.release(conn);
        }
        assert_eq!(server.connections_opened(), 1);
        assert_eq!(server.call_count(), 5);
    }

    #[tokio::test]
    async fn test_slot_is_returned_when_the_call_fails() {
        let server = StubToolServer::shared("primary");
        server.fail_next(ToolError::malformed("garbage"), 1);
        let pool = pool(1);
        pool.register(server.clone());

        {
            let conn = assert_ok!(pool.acquire("primary").await);
            assert_err!(conn.call("list_products", &Map::new()).await);
        }
        let conn = assert_ok!(pool.acquire("primary").await);
        assert_ok!(conn.call("list_products", &Map::new()).await);
    }

    #[tokio::test]
    async fn test_restart_discards_open_connections() {
        let server = StubToolServer::shared("primary");
        let pool = pool(2);
        pool.register(server.clone());

        let held = assert_ok!(pool.acquire("primary").await);
        let idle = assert_ok!(pool.acquire("primary").await);
        pool.release(idle);
        assert_eq!(pool.stats()[0].idle, 1);

        assert!(pool.restart("primary"));
        assert_eq!(pool.stats()[0].idle, 0);

        // A connection checked out before the restart is not pooled again.
        pool.release(held);
        assert_eq!(pool.stats()[0].idle, 0);

        let fresh = assert_ok!(pool.acquire("primary").await);
        drop(fresh);
        assert_eq!(server.connections_opened(), 3);
        assert!(!pool.restart("missing"));
    }

    #[tokio::test]
    async fn test_unknown_server_is_unsupported() {
        let pool = pool(1);
        let err = assert_err!(pool.acquire("nowhere").await);
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    }

    #[tokio::test]
    async fn test_concurrent_calls_respect_pool_size() {
        let server = StubToolServer::shared("primary");
        let client = EnhancedClient::builder()
            .pool_size(1)
            .acquire_timeout(Duration::from_millis(20))
            .cache_ttl(Duration::ZERO)
            .retry(crate::RetryPolicy {
                max_retries: 0,
                ..crate::RetryPolicy::default()
            })
            .server(server.clone())
            .build();

        let slow = ToolCallRequest::from_value("slow", json!({"delay_ms": 150})).unwrap();
        let quick = ToolCallRequest::from_value("quick", json!({})).unwrap();

        let (slow_result, quick_result) = tokio::join!(client.call(&slow), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            client.call(&quick).await
        });

        let slow_result = assert_ok!(slow_result);
        assert_eq!(slow_result.served_by, ServedBy::Primary);
        let err = assert_err!(quick_result);
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert_eq!(server.call_count(), 1);
    }
}
