//! Transport Module Tests
//!
//! ## Test Scopes
//! - **Registry**: handler registration, dispatch and missing handlers.
//! - **Local hub**: request/response, one-way delivery, offline nodes and liveness.
//! - **Wire format**: messages keep their shape through JSON.
//! - **HTTP loopback**: transport, remote barrier sign-on and directory over a real axum server.

#[cfg(test)]
mod tests {
    use crate::cluster::types::NodeId;
    use crate::cluster::{Liveness, PeerResolver};
    use crate::compute::types::{TaskContextData, TaskPayload};
    use crate::directory::{
        Directory, DirectoryEntry, ENDPOINT_DIRECTORY, HttpDirectory, LocalDirectory,
        handle_get_entry, handle_put_entry, master_key,
    };
    use crate::error::NetworkError;
    use crate::net::Network;
    use crate::net::http::{HttpNetwork, handle_message};
    use crate::net::local::LocalHub;
    use crate::net::protocol::{ENDPOINT_MESSAGE, Envelope, Message, MessageKind};
    use crate::net::registry::{HandlerRegistry, message_handler};
    use crate::sync::BarrierService;
    use crate::sync::http::{
        ENDPOINT_BARRIER_RESIZE, ENDPOINT_BARRIER_SIGN_ON, HttpBarrierService, handle_resize,
        handle_sign_on,
    };
    use crate::sync::table::BarrierTable;
    use axum::{
        Extension, Router,
        routing::{get, post},
    };
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn node(name: &str) -> NodeId {
        NodeId::from(name)
    }

    fn envelope(message: Message) -> Envelope {
        Envelope {
            source: node("a"),
            target: node("b"),
            message,
        }
    }

    // ============================================================
    // HANDLER REGISTRY TESTS
    // ============================================================

    #[tokio::test]
    async fn test_registry_dispatches_to_registered_handler() {
        // ARRANGE
        let registry = HandlerRegistry::new();
        registry.register(
            MessageKind::JoinRequest,
            message_handler(|envelope: Envelope| async move {
                assert_eq!(envelope.source, NodeId::from("a"));
                Some(Message::JoinResponse {
                    status: 0,
                    barrier: None,
                })
            }),
        );

        // ACT
        let response = registry.dispatch(envelope(Message::JoinRequest)).await;

        // ASSERT
        assert!(registry.has_handler(MessageKind::JoinRequest));
        assert_eq!(registry.handler_count(), 1);
        assert_eq!(
            response.unwrap(),
            Some(Message::JoinResponse {
                status: 0,
                barrier: None
            })
        );
    }

    #[tokio::test]
    async fn test_registry_without_handler_reports_no_handler() {
        let registry = HandlerRegistry::new();

        let result = registry.dispatch(envelope(Message::Signal { code: 1 })).await;

        assert!(matches!(result, Err(NetworkError::NoHandler { .. })));
    }

    // ============================================================
    // LOCAL HUB TESTS
    // ============================================================

    #[tokio::test]
    async fn test_send_and_wait_returns_handler_response() {
        // ARRANGE
        let hub = LocalHub::new(Duration::from_secs(1));
        let a = hub.attach(node("a"));
        let b = hub.attach(node("b"));
        b.register_handler(
            MessageKind::ExecuteRequest,
            message_handler(|_envelope: Envelope| async move {
                Some(Message::ExecuteResponse { status: 0 })
            }),
        );

        let request = Message::ExecuteRequest {
            barrier_tag: 1,
            context: TaskContextData {
                group: 0,
                rank: 0,
                slaves: vec![node("b")],
            },
            payload: TaskPayload::new("echo"),
        };

        // ACT
        let response = a.send_and_wait(&node("b"), request).await.unwrap();

        // ASSERT
        assert_eq!(response, Message::ExecuteResponse { status: 0 });
        let deliveries = hub.deliveries().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].source, node("a"));
        assert_eq!(deliveries[0].kind, MessageKind::ExecuteRequest);
    }

    #[tokio::test]
    async fn test_one_way_send_runs_handler() {
        // ARRANGE
        let hub = LocalHub::new(Duration::from_secs(1));
        let a = hub.attach(node("a"));
        let b = hub.attach(node("b"));
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        b.register_handler(
            MessageKind::Signal,
            message_handler(move |_envelope: Envelope| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }),
        );

        // ACT
        a.send(&node("b"), Message::Signal { code: 1 }).await.unwrap();

        // ASSERT: delivery is asynchronous
        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_offline_node_is_unreachable_and_not_live() {
        // ARRANGE
        let hub = LocalHub::new(Duration::from_secs(1));
        let a = hub.attach(node("a"));
        let _b = hub.attach(node("b"));

        // ACT
        hub.set_offline(&node("b"), true);
        let result = a.send(&node("b"), Message::Signal { code: 1 }).await;

        // ASSERT
        let err = result.unwrap_err();
        assert!(err.is_unreachable());
        assert!(!hub.is_online(&node("b")));
        assert!(hub.is_online(&node("a")));
        assert!(hub.deliveries().await.is_empty());

        hub.set_offline(&node("b"), false);
        assert!(hub.is_online(&node("b")));
    }

    #[tokio::test]
    async fn test_unknown_target_and_missing_response() {
        let hub = LocalHub::new(Duration::from_secs(1));
        let a = hub.attach(node("a"));
        let b = hub.attach(node("b"));
        b.register_handler(
            MessageKind::JoinRequest,
            message_handler(|_envelope: Envelope| async move { None }),
        );

        let unknown = a.send(&node("nobody"), Message::JoinRequest).await;
        assert!(matches!(unknown, Err(NetworkError::UnknownPeer(_))));

        let silent = a.send_and_wait(&node("b"), Message::JoinRequest).await;
        let err = silent.unwrap_err();
        assert!(matches!(err, NetworkError::UnexpectedResponse { .. }));
        assert!(!err.is_unreachable());
    }

    #[tokio::test]
    async fn test_slow_handler_times_out() {
        let hub = LocalHub::new(Duration::from_millis(20));
        let a = hub.attach(node("a"));
        let b = hub.attach(node("b"));
        b.register_handler(
            MessageKind::JoinRequest,
            message_handler(|_envelope: Envelope| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                None
            }),
        );

        let result = a.send_and_wait(&node("b"), Message::JoinRequest).await;

        assert!(matches!(result, Err(NetworkError::Timeout(_))));
    }

    // ============================================================
    // WIRE FORMAT TESTS
    // ============================================================

    #[test]
    fn test_message_json_is_tagged_by_kind() {
        let json = serde_json::to_value(Message::ExecuteResponse { status: 2 }).unwrap();

        assert_eq!(json["kind"], "execute_response");
        assert_eq!(json["status"], 2);

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind(), MessageKind::ExecuteResponse);
    }

    // ============================================================
    // HTTP LOOPBACK TESTS
    // ============================================================

    struct StaticPeers(HashMap<NodeId, SocketAddr>);

    impl PeerResolver for StaticPeers {
        fn http_addr(&self, id: &NodeId) -> Option<SocketAddr> {
            self.0.get(id).copied()
        }
    }

    struct LoopbackServer {
        addr: SocketAddr,
        network: Arc<HttpNetwork>,
        barriers: Arc<BarrierTable>,
        directory: Arc<LocalDirectory>,
    }

    /// Serves node "b" on an ephemeral loopback port.
    async fn serve_loopback() -> LoopbackServer {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let peers = Arc::new(StaticPeers(HashMap::from([(node("b"), addr)])));
        let network = HttpNetwork::new(node("b"), peers, Duration::from_secs(2));
        let barriers = BarrierTable::new(node("b"), Some(Duration::from_secs(2)));
        let directory = LocalDirectory::new();

        let app = Router::new()
            .route(ENDPOINT_MESSAGE, post(handle_message))
            .route(ENDPOINT_BARRIER_SIGN_ON, post(handle_sign_on))
            .route(ENDPOINT_BARRIER_RESIZE, post(handle_resize))
            .route(
                &format!("{}/:key", ENDPOINT_DIRECTORY),
                get(handle_get_entry).put(handle_put_entry),
            )
            .layer(Extension(network.clone()))
            .layer(Extension(barriers.clone()))
            .layer(Extension(directory.clone()));

        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        LoopbackServer {
            addr,
            network,
            barriers,
            directory,
        }
    }

    fn peers_of(server: &LoopbackServer) -> Arc<StaticPeers> {
        Arc::new(StaticPeers(HashMap::from([(node("b"), server.addr)])))
    }

    #[tokio::test]
    async fn test_http_send_and_wait_over_loopback() {
        // ARRANGE
        let server = serve_loopback().await;
        server.network.register_handler(
            MessageKind::ExecuteRequest,
            message_handler(|envelope: Envelope| async move {
                assert_eq!(envelope.source, NodeId::from("a"));
                Some(Message::ExecuteResponse { status: 2 })
            }),
        );
        let client = HttpNetwork::new(node("a"), peers_of(&server), Duration::from_secs(2));

        let request = Message::ExecuteRequest {
            barrier_tag: 1,
            context: TaskContextData {
                group: 0,
                rank: 0,
                slaves: vec![node("b")],
            },
            payload: TaskPayload::new("echo"),
        };

        // ACT
        let response = client.send_and_wait(&node("b"), request).await.unwrap();
        let missing = client.send(&node("b"), Message::Signal { code: 1 }).await;

        // ASSERT
        assert_eq!(response, Message::ExecuteResponse { status: 2 });
        assert!(matches!(missing, Err(NetworkError::NoHandler { .. })));
        assert!(!missing.unwrap_err().is_unreachable());
    }

    #[tokio::test]
    async fn test_http_sign_on_is_forwarded_to_barrier_owner() {
        // ARRANGE: b owns a barrier for two signers
        let server = serve_loopback().await;
        let owner_side = HttpBarrierService::new(
            node("b"),
            server.barriers.clone(),
            peers_of(&server),
        );
        let barrier = owner_side.allocate(1).await.unwrap();

        let remote_side = HttpBarrierService::new(
            node("a"),
            BarrierTable::new(node("a"), None),
            peers_of(&server),
        );
        remote_side.resize(&barrier, 2).await.unwrap();
        assert_eq!(server.barriers.size(&barrier), Some(2));

        // ACT
        let remote = {
            let barrier = barrier.clone();
            tokio::spawn(async move { remote_side.sign_on(&barrier, 5, None).await })
        };
        let local = owner_side.sign_on(&barrier, 9, None).await.unwrap().unwrap();

        // ASSERT: both sides see the same round
        let remote = remote.await.unwrap().unwrap().unwrap();
        assert_eq!(local.data_of(&node("a")), Some(5));
        assert_eq!(local.data_of(&node("b")), Some(9));
        assert_eq!(remote.data_of(&node("a")), Some(5));
        assert_eq!(remote.signers.len(), 2);
    }

    #[tokio::test]
    async fn test_http_directory_register_and_lookup() {
        // ARRANGE
        let server = serve_loopback().await;
        let client = HttpDirectory::new(server.addr, Duration::from_secs(2));

        // ACT
        let before = client.lookup(&master_key(3)).await.unwrap();
        client
            .register(&master_key(3), DirectoryEntry::Node(node("b")))
            .await
            .unwrap();

        // ASSERT: the key keeps its slashes on the hosting side
        assert_eq!(before, None);
        assert_eq!(
            client.lookup(&master_key(3)).await.unwrap(),
            Some(DirectoryEntry::Node(node("b")))
        );
        assert_eq!(
            server.directory.lookup(&master_key(3)).await.unwrap(),
            Some(DirectoryEntry::Node(node("b")))
        );
    }
}
