use bytes::Bytes;
use chrono::{TimeDelta, Utc};
use peersdb_core::{
    BENCHMARK_DISABLED_NOTICE, CommandClient, ContentRef, ContentStore, Contribution, LogEntry,
    LogSync, MemoryEndpoint, MemoryNetwork, Method, NodeBuilder, NodeContext, NodeOptions,
    NodeService, PeerId, PeersError, Request, ResponseBody, StoreAddress, StoreAdvertisement,
    Transport, ValidationRecord,
    ValidationRequest, ValidationVote, VALIDATION_TOPIC, decode_message, encode_message,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

struct TestNode {
    endpoint: MemoryEndpoint,
    client: CommandClient,
    service: NodeService,
    _data_dir: TempDir,
}

impl TestNode {
    async fn start(network: &MemoryNetwork, name: &str, configure: impl FnOnce(&mut NodeOptions)) -> Self {
        let data_dir = tempfile::tempdir().unwrap();
        let mut options = NodeOptions {
            repo: name.to_string(),
            data_dir: data_dir.path().to_path_buf(),
            download_dir: data_dir.path().join("downloads").display().to_string(),
            ..NodeOptions::default()
        };
        configure(&mut options);

        let endpoint = network.endpoint(PeerId::new(name)).unwrap();
        let shared = Arc::new(endpoint.clone());
        let ctx = NodeBuilder::new()
            .options(options)
            .transport(shared.clone())
            .content(shared.clone())
            .log_sync(shared)
            .build()
            .unwrap();
        endpoint.attach_registry(&ctx.logs).unwrap();

        let (client, queues) = CommandClient::channel();
        let service = NodeService::start(ctx, queues).await.unwrap();

        Self {
            endpoint,
            client,
            service,
            _data_dir: data_dir,
        }
    }

    fn ctx(&self) -> &Arc<NodeContext> {
        self.service.context()
    }

    fn peer_id(&self) -> PeerId {
        self.ctx().peer_id.clone()
    }

    async fn call(&self, method: Method, args: &[&str]) -> peersdb_core::Response {
        let args = args.iter().map(|arg| arg.to_string()).collect();
        self.client.call(Request::new(method, args).unwrap()).await
    }
}

async fn root(network: &MemoryNetwork, name: &str) -> TestNode {
    TestNode::start(network, name, |options| options.root = true).await
}

async fn leaf(network: &MemoryNetwork, name: &str) -> TestNode {
    TestNode::start(network, name, |_| {}).await
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
}

fn uploaded_ref(body: ResponseBody) -> ContentRef {
    match body {
        ResponseBody::Message(message) => {
            ContentRef::parse(message.trim_start_matches("File uploaded as ")).unwrap()
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test]
async fn test_post_without_store_is_recoverable_error() {
    let network = MemoryNetwork::new();
    let node = leaf(&network, "lonely").await;

    let err = node.call(Method::Post, &["data"]).await.unwrap_err();
    assert!(matches!(err, PeersError::NoDatastore));
    assert_eq!(
        err.to_string(),
        "you need a datastore first, try connecting to a peer"
    );

    // The dispatcher keeps serving after the failure
    let notice = node.call(Method::Benchmark, &[]).await.unwrap();
    assert_eq!(notice, ResponseBody::Notice(BENCHMARK_DISABLED_NOTICE.to_string()));

    let err = node.call(Method::Query, &[]).await.unwrap_err();
    assert!(matches!(err, PeersError::NoDatastore));
}

#[tokio::test]
async fn test_malformed_request_gets_error_response() {
    let network = MemoryNetwork::new();
    let node = leaf(&network, "strict").await;

    let malformed = Request {
        method: Method::Get,
        args: vec![],
    };
    let err = node.client.call(malformed).await.unwrap_err();
    assert!(matches!(err, PeersError::InvalidRequest(_)));

    let err = node.call(Method::Get, &["/content/not-a-digest"]).await.unwrap_err();
    assert!(matches!(err, PeersError::InvalidRequest(_)));
}

#[tokio::test]
async fn test_connect_hands_store_to_new_peer_exactly_once() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    let b = leaf(&network, "b").await;
    let c = root(&network, "c").await;

    let a_address = a.ctx().contributions.get().unwrap().address().clone();
    assert!(b.ctx().contributions.get().is_none());

    let response = b.call(Method::Connect, &["a"]).await.unwrap();
    assert_eq!(response, ResponseBody::Message("Connected to peer a".to_string()));
    settle().await;

    let bound = b.ctx().contributions.get().unwrap();
    assert_eq!(bound.address(), &a_address);
    assert_eq!(
        b.ctx().state().unwrap().contributions_store_addr,
        a_address.to_string()
    );

    // A later advertisement of a different store is ignored
    b.call(Method::Connect, &["c"]).await.unwrap();
    settle().await;
    assert_eq!(b.ctx().contributions.get().unwrap().address(), &a_address);
    assert_ne!(c.ctx().contributions.get().unwrap().address(), &a_address);
}

#[tokio::test]
async fn test_bootstrapped_peer_replicates_existing_contributions() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    let first = uploaded_ref(a.call(Method::Post, &["first"]).await.unwrap());

    let b = leaf(&network, "b").await;
    b.call(Method::Connect, &["a"]).await.unwrap();
    settle().await;

    let log = b.ctx().contributions.get().unwrap();
    let entries = log.list().unwrap();
    assert_eq!(entries.len(), 1);
    let contribution = Contribution::decode(&entries[0].payload).unwrap();
    assert_eq!(contribution.content_ref, first);
    assert_eq!(contribution.contributor, a.peer_id());

    // Writes after the handshake flow both ways
    b.call(Method::Post, &["second"]).await.unwrap();
    settle().await;
    assert_eq!(a.ctx().contributions.get().unwrap().len().unwrap(), 2);
}

#[tokio::test]
async fn test_local_post_is_self_validated() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;

    let content_ref = uploaded_ref(a.call(Method::Post, &["payload"]).await.unwrap());
    settle().await;

    let record = a.ctx().validations.get(&content_ref).unwrap().unwrap();
    assert!(record.is_valid);
    assert_eq!(record.vote_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_query_returns_all_entries_after_settle_window() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    for payload in ["one", "two", "three"] {
        a.call(Method::Post, &[payload]).await.unwrap();
    }
    settle().await;

    let started = tokio::time::Instant::now();
    let response = a.call(Method::Query, &[]).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));

    match response {
        ResponseBody::Contributions(items) => {
            assert_eq!(items.len(), 3);
            assert!(items.iter().all(|item| item.valid == Some(true)));
            assert!(items.iter().all(|item| item.contribution.contributor == a.peer_id()));
        }
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_query_skips_foreign_entries() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    a.call(Method::Post, &["good"]).await.unwrap();
    a.ctx()
        .contributions
        .get()
        .unwrap()
        .add(br#"{"key":"x"}"#.to_vec())
        .await
        .unwrap();

    match a.call(Method::Query, &[]).await.unwrap() {
        ResponseBody::Contributions(items) => assert_eq!(items.len(), 1),
        other => panic!("unexpected response {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_quorum_of_connected_peers_decides_validity() {
    let network = MemoryNetwork::new();
    let asker = root(&network, "asker").await;
    let content_ref = asker.endpoint.add(Bytes::from_static(b"shared")).await.unwrap();

    // Three peers vote yes: 3 > 0.5 * 4 connected
    let mut voters = Vec::new();
    for (index, vote) in [true, true, true, false].into_iter().enumerate() {
        let voter = leaf(&network, &format!("voter-{}", index)).await;
        voter
            .ctx()
            .validations
            .upsert(&ValidationRecord::self_determined(content_ref.clone(), vote))
            .unwrap();
        asker
            .call(Method::Connect, &[format!("voter-{}", index).as_str()])
            .await
            .unwrap();
        voters.push(voter);
    }
    settle().await;

    let validate = peersdb_core::ValidateContentOperation::new(asker.ctx().clone());
    let started = tokio::time::Instant::now();
    let record = validate.run(&content_ref).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert!(record.is_valid);
    assert_eq!(record.vote_count, 4);
    assert_eq!(asker.ctx().validations.get(&content_ref).unwrap(), Some(record));
}

#[tokio::test(start_paused = true)]
async fn test_minority_falls_back_to_local_predicate() {
    struct RejectAll;

    #[async_trait::async_trait]
    impl peersdb_core::ValidityPredicate for RejectAll {
        async fn validate(&self, _: &ContentRef, _: &Bytes) -> peersdb_core::Result<bool> {
            Ok(false)
        }
    }

    let network = MemoryNetwork::new();
    let endpoint = network.endpoint(PeerId::new("asker")).unwrap();
    let shared = Arc::new(endpoint.clone());
    let data_dir = tempfile::tempdir().unwrap();
    let ctx = NodeBuilder::new()
        .options(NodeOptions {
            repo: "asker".to_string(),
            data_dir: data_dir.path().to_path_buf(),
            ..NodeOptions::default()
        })
        .transport(shared.clone())
        .content(shared.clone())
        .log_sync(shared)
        .predicate(Arc::new(RejectAll))
        .build()
        .unwrap();

    let content_ref = endpoint.add(Bytes::from_static(b"contested")).await.unwrap();
    let mut voters = Vec::new();
    for (index, vote) in [true, false, false].into_iter().enumerate() {
        let voter = leaf(&network, &format!("voter-{}", index)).await;
        voter
            .ctx()
            .validations
            .upsert(&ValidationRecord::self_determined(content_ref.clone(), vote))
            .unwrap();
        endpoint.connect(&format!("voter-{}", index)).await.unwrap();
        voters.push(voter);
    }
    settle().await;

    let validate = peersdb_core::ValidateContentOperation::new(ctx.clone());
    let record = validate.run(&content_ref).await.unwrap();
    assert!(!record.is_valid);
    assert_eq!(record.vote_count, 3);

    // Cached from now on: no second round, no waiting
    let started = tokio::time::Instant::now();
    assert!(!validate.is_valid(&content_ref).await.unwrap());
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_lookup_without_peers_is_self_determined() {
    let network = MemoryNetwork::new();
    let node = root(&network, "alone").await;
    let content_ref = node.endpoint.add(Bytes::from_static(b"solo")).await.unwrap();

    let validate = peersdb_core::ValidateContentOperation::new(node.ctx().clone());
    let record = validate.run(&content_ref).await.unwrap();
    assert!(record.is_valid);
    assert_eq!(record.vote_count, 0);

    let missing = ContentRef::from_digest(&"ab".repeat(32)).unwrap();
    assert!(matches!(
        validate.run(&missing).await,
        Err(PeersError::ContentNotFound(_))
    ));
}

#[tokio::test]
async fn test_responder_only_votes_with_self_determined_records() {
    let network = MemoryNetwork::new();
    let responder = leaf(&network, "responder").await;
    let asker = network.endpoint(PeerId::new("asker")).unwrap();
    asker.connect("responder").await.unwrap();

    let own = ContentRef::from_digest(&"11".repeat(32)).unwrap();
    let relayed = ContentRef::from_digest(&"22".repeat(32)).unwrap();
    let unknown = ContentRef::from_digest(&"33".repeat(32)).unwrap();
    let validations = &responder.ctx().validations;
    validations
        .upsert(&ValidationRecord::self_determined(own.clone(), false))
        .unwrap();
    validations
        .upsert(&ValidationRecord {
            content_ref: relayed.clone(),
            is_valid: true,
            vote_count: 3,
        })
        .unwrap();

    let mut replies = Vec::new();
    for content_ref in [&own, &relayed, &unknown] {
        let request = ValidationRequest {
            content_ref: content_ref.clone(),
            requester: PeerId::new("asker"),
        };
        replies.push(asker.subscribe(&request.reply_topic()).await.unwrap());
        asker
            .publish(VALIDATION_TOPIC, Bytes::from(encode_message(&request).unwrap()))
            .await
            .unwrap();
    }
    settle().await;

    let vote: ValidationVote = decode_message(&replies[0].next().await.unwrap()).unwrap();
    assert!(!vote.vote);
    for silent in &mut replies[1..] {
        let waited = tokio::time::timeout(Duration::from_millis(100), silent.next()).await;
        assert!(waited.is_err());
    }
}

#[tokio::test]
async fn test_full_replica_pins_replicated_content() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    let b = TestNode::start(&network, "b", |options| options.full_replica = true).await;

    let before = uploaded_ref(a.call(Method::Post, &["before"]).await.unwrap());
    b.call(Method::Connect, &["a"]).await.unwrap();
    settle().await;
    let after = uploaded_ref(a.call(Method::Post, &["after"]).await.unwrap());
    settle().await;

    assert!(network.is_pinned(&b.peer_id(), &before));
    assert!(network.is_pinned(&b.peer_id(), &after));
    assert!(!network.is_pinned(&a.peer_id(), &before));
}

#[tokio::test]
async fn test_replication_feeds_benchmark() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    let b = TestNode::start(&network, "b", |options| options.benchmark = true).await;

    // Backlog: an entry stamped well before b started
    let old = Contribution {
        content_ref: ContentRef::from_digest(&"44".repeat(32)).unwrap(),
        contributor: a.peer_id(),
        created_at: Utc::now() - TimeDelta::hours(1),
    };
    a.ctx()
        .contributions
        .get()
        .unwrap()
        .add(old.encode().unwrap())
        .await
        .unwrap();

    b.call(Method::Connect, &["a"]).await.unwrap();
    settle().await;
    {
        let benchmark = b.ctx().benchmark().unwrap();
        assert!(benchmark.bootstrap_latency() > Duration::ZERO);
        assert!(benchmark.new_contribution_latencies().is_empty());
    }

    a.call(Method::Post, &["fresh"]).await.unwrap();
    settle().await;

    let bootstrap = b.ctx().benchmark().unwrap().bootstrap_latency();
    match b.call(Method::Benchmark, &[]).await.unwrap() {
        ResponseBody::Benchmark(report) => {
            assert!((report.bootstrap - bootstrap.as_secs_f64()).abs() < 1e-9);
            assert!(report.maxc >= report.minc);
        }
        other => panic!("unexpected response {:?}", other),
    }
    assert_eq!(b.ctx().benchmark().unwrap().new_contribution_latencies().len(), 1);
}

#[tokio::test]
async fn test_get_writes_content_to_download_dir() {
    let network = MemoryNetwork::new();
    let a = root(&network, "a").await;
    let content_ref = uploaded_ref(a.call(Method::Post, &["hello world"]).await.unwrap());

    let response = a
        .call(Method::Get, &[content_ref.to_string().as_str()])
        .await
        .unwrap();
    let destination = std::path::PathBuf::from(&a.ctx().options.download_dir).join(content_ref.digest());
    assert_eq!(
        response,
        ResponseBody::Message(format!(
            "stored {} successfully under {}",
            content_ref,
            destination.display()
        ))
    );
    assert_eq!(std::fs::read(&destination).unwrap(), b"hello world");
}

#[tokio::test]
async fn test_shutdown_persists_state_and_restart_resolves_store() {
    let network = MemoryNetwork::new();
    let data_dir = tempfile::tempdir().unwrap();
    let options = NodeOptions {
        repo: "persist".to_string(),
        data_dir: data_dir.path().to_path_buf(),
        root: true,
        ..NodeOptions::default()
    };

    let endpoint = Arc::new(network.endpoint(PeerId::new("persist")).unwrap());
    let ctx = NodeBuilder::new()
        .options(options.clone())
        .transport(endpoint.clone())
        .content(endpoint.clone())
        .log_sync(endpoint.clone())
        .build()
        .unwrap();
    let (client, queues) = CommandClient::channel();
    let service = NodeService::start(ctx, queues).await.unwrap();
    client
        .call(Request::new(Method::Post, vec!["kept".to_string()]).unwrap())
        .await
        .unwrap();
    let address = service.context().contributions.get().unwrap().address().clone();
    service.shutdown().await.unwrap();

    assert!(options.state_path().exists());
    assert!(options.benchmark_path().exists());

    // Restart as a non-root node: the persisted address still resolves
    let ctx = NodeBuilder::new()
        .options(NodeOptions {
            root: false,
            ..options
        })
        .transport(endpoint.clone())
        .content(endpoint.clone())
        .log_sync(endpoint)
        .build()
        .unwrap();
    let (_client, queues) = CommandClient::channel();
    let service = NodeService::start(ctx, queues).await.unwrap();
    let log = service.context().contributions.get().unwrap();
    assert_eq!(log.address(), &address);
    assert_eq!(log.len().unwrap(), 1);
    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_malformed_advertisement_is_ignored() {
    let network = MemoryNetwork::new();
    let node = leaf(&network, "target").await;
    let sender = network.endpoint(PeerId::new("sender")).unwrap();
    sender.connect("target").await.unwrap();

    sender
        .publish("target", Bytes::from_static(b"not json"))
        .await
        .unwrap();
    settle().await;
    assert!(node.ctx().contributions.get().is_none());

    let bogus = StoreAdvertisement {
        peer_id: PeerId::new("sender"),
        log_address: "contributions".to_string(),
    };
    sender
        .publish("target", Bytes::from(encode_message(&bogus).unwrap()))
        .await
        .unwrap();
    settle().await;
    assert!(node.ctx().contributions.get().is_none());
    assert!(!node.ctx().shutdown.is_cancelled());
}

/// Holds every push until released.
#[derive(Default)]
struct GatedSync {
    entered: Notify,
    release: Notify,
}

#[async_trait::async_trait]
impl LogSync for GatedSync {
    async fn push(&self, _: &StoreAddress, _: &[LogEntry]) -> peersdb_core::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn pull(&self, _: &StoreAddress) -> peersdb_core::Result<Vec<LogEntry>> {
        Ok(vec![])
    }
}

#[tokio::test]
async fn test_shutdown_during_post_answers_with_committed_result() {
    let network = MemoryNetwork::new();
    let data_dir = tempfile::tempdir().unwrap();
    let endpoint = Arc::new(network.endpoint(PeerId::new("gated")).unwrap());
    let gated = Arc::new(GatedSync::default());
    let ctx = NodeBuilder::new()
        .options(NodeOptions {
            repo: "gated".to_string(),
            data_dir: data_dir.path().to_path_buf(),
            root: true,
            ..NodeOptions::default()
        })
        .transport(endpoint.clone())
        .content(endpoint)
        .log_sync(gated.clone())
        .build()
        .unwrap();
    let (client, queues) = CommandClient::channel();
    let service = NodeService::start(ctx.clone(), queues).await.unwrap();

    let post = tokio::spawn({
        let client = client.clone();
        async move {
            client
                .call(Request::new(Method::Post, vec!["in flight".to_string()]).unwrap())
                .await
        }
    });

    gated.entered.notified().await;
    ctx.shutdown.cancel();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    gated.release.notify_one();

    let content_ref = uploaded_ref(post.await.unwrap().unwrap());
    let logged: Vec<ContentRef> = ctx
        .contributions
        .get()
        .unwrap()
        .list()
        .unwrap()
        .iter()
        .map(|entry| Contribution::decode(&entry.payload).unwrap().content_ref)
        .collect();
    assert_eq!(logged, vec![content_ref]);

    // Nothing is dequeued once shutdown was requested
    let err = client.call(Request::new(Method::Query, vec![]).unwrap()).await.unwrap_err();
    assert!(matches!(err, PeersError::Internal(_)));

    service.shutdown().await.unwrap();
}
