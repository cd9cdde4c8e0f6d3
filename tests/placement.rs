//! End-to-end placement scenarios over real in-process nodes.
//!
//! Each node binds ephemeral ports on loopback and runs the full
//! stack: discovery, scheduler, providers, session fabric, stores.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use weavemesh::config::FabricConfig;
use weavemesh::discovery::messages::GossipMessage;
use weavemesh::rpc::RpcClient;
use weavemesh::scheduler::{
    DeployComponentRequest, PolicyChain, PolicyContext, PolicyDecision, RuntimeEnv,
    SchedulePolicy, UndeployRequest, UpstreamAddrs,
};
use weavemesh::store::{EncodedObject, Language, ObjectStore, StoreClient};
use weavemesh::{FabricNode, ResourceInfo};

struct TestNode {
    node: Arc<FabricNode>,
    _data_dir: tempfile::TempDir,
}

async fn start_node(name: &str, domain: &str, cpu: i64) -> TestNode {
    start_node_with_policies(name, domain, cpu, PolicyChain::new()).await
}

async fn start_node_with_policies(
    name: &str,
    domain: &str,
    cpu: i64,
    policies: PolicyChain,
) -> TestNode {
    let data_dir = tempfile::tempdir().unwrap();
    let mut config = FabricConfig::default();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.scheduler_port = 0;
    config.node.name = name.to_string();
    config.node.domain_id = domain.to_string();
    config.node.data_dir = data_dir.path().to_path_buf();
    config.resource.cpu = cpu;
    config.resource.memory = weavemesh::config::MemSize(16 * 1024 * 1024 * 1024);
    config.resource.gpu = 0;

    let node = FabricNode::start_with_policies(config, policies).await.unwrap();
    TestNode { node, _data_dir: data_dir }
}

fn deploy_request(cpu: i64) -> DeployComponentRequest {
    DeployComponentRequest {
        runtime: RuntimeEnv { image: "demo:latest".to_string(), language: Language::Json },
        resources: ResourceInfo::new(cpu, 256 * 1024 * 1024, 0),
        target_node_id: None,
        target_address: None,
        upstream: UpstreamAddrs::default(),
    }
}

/// Link `a` to `b` and run one gossip round so `a` learns `b`'s view.
async fn introduce(a: &TestNode, b: &TestNode) {
    a.node.discovery().manager().add_peer(&b.node.rpc_addr().to_string());
    a.node.discovery().gossip_round().await;
}

#[tokio::test]
async fn single_node_deploys_locally_and_accounts_resources() {
    let a = start_node("node-a", "dom-s1", 4000).await;

    // Pre-existing load leaves 2000m free.
    let first = a.node.deploy(deploy_request(2000)).await;
    assert!(first.success, "{:?}", first.error);

    let reply = a.node.deploy(deploy_request(1000)).await;
    assert!(reply.success, "{:?}", reply.error);
    assert!(reply.provider_id.as_deref().unwrap().starts_with("local."));
    assert_eq!(reply.node_id.as_deref().unwrap(), a.node.node_id());

    let capacity = a.node.providers().aggregate_capacity().await;
    assert_eq!(capacity.used.cpu, 3000);
    assert_eq!(capacity.available.cpu, 1000);

    // Exactly one record per committed deployment.
    let status = a
        .node
        .scheduler()
        .get_deployment_status(reply.component_id.as_deref().unwrap());
    assert!(status.success);

    a.node.shutdown();
}

#[tokio::test]
async fn exhausted_node_delegates_to_the_roomier_peer() {
    let a = start_node("node-a", "dom-s2", 500).await;
    let b = start_node("node-b", "dom-s2", 8000).await;
    introduce(&a, &b).await;

    let reply = a.node.deploy(deploy_request(4000)).await;
    assert!(reply.success, "{:?}", reply.error);

    let provider_id = reply.provider_id.unwrap();
    assert!(
        provider_id.ends_with(&format!("@{}", b.node.node_id())),
        "unexpected provider binding {provider_id}"
    );

    // The component is registered on A so it stays addressable, and
    // committed on B.
    let component_id = reply.component_id.unwrap();
    assert!(a.node.scheduler().get_deployment_status(&component_id).success);
    assert!(b.node.scheduler().get_deployment_status(&component_id).success);
    assert_eq!(b.node.providers().aggregate_capacity().await.used.cpu, 4000);

    // Undeploy flows back through the namespaced binding.
    a.node
        .scheduler()
        .undeploy_component(&UndeployRequest { component_id: component_id.clone(), provider_id: None })
        .await
        .unwrap();
    assert!(!a.node.scheduler().get_deployment_status(&component_id).success);
    assert_eq!(b.node.providers().aggregate_capacity().await.used.cpu, 0);

    a.node.shutdown();
    b.node.shutdown();
}

#[tokio::test]
async fn duplicate_gossip_is_accepted_once() {
    let a = start_node("node-a", "dom-s3", 1000).await;
    let b = start_node("node-b", "dom-s3", 1000).await;
    let c = start_node("node-c", "dom-s3", 1000).await;

    a.node.discovery().manager().add_peer(&b.node.rpc_addr().to_string());
    a.node.discovery().manager().add_peer(&c.node.rpc_addr().to_string());
    a.node.discovery().gossip_round().await;

    // A learned both peers through the round's acks.
    let known: Vec<String> = a
        .node
        .discovery()
        .manager()
        .known_nodes()
        .into_iter()
        .map(|n| n.id)
        .collect();
    assert!(known.contains(&b.node.node_id().to_string()));
    assert!(known.contains(&c.node.node_id().to_string()));

    // The same message id forwarded back twice is absorbed after the
    // first delivery.
    let client = RpcClient::new();
    let message_id = Uuid::new_v4();
    let make_message = || GossipMessage {
        sender_node_id: b.node.node_id().to_string(),
        sender_address: b.node.rpc_addr().to_string(),
        sender_domain_id: "dom-s3".to_string(),
        nodes: vec![b.node.discovery().manager().local_node()],
        message_id,
        timestamp: Utc::now(),
        ttl: 5,
        max_hops: 5,
    };

    let first = client.gossip(&a.node.rpc_addr().to_string(), make_message()).await.unwrap();
    assert!(!first.nodes.is_empty());
    assert!(a.node.discovery().manager().is_message_processed(&message_id));

    let second = client.gossip(&a.node.rpc_addr().to_string(), make_message()).await.unwrap();
    assert!(second.nodes.is_empty());

    a.node.shutdown();
    b.node.shutdown();
    c.node.shutdown();
}

#[tokio::test]
async fn cross_domain_peers_never_merge() {
    let a = start_node("node-a", "dom-east", 1000).await;
    let b = start_node("node-b", "dom-west", 1000).await;
    introduce(&a, &b).await;

    assert!(a.node.discovery().manager().known_nodes().is_empty());

    a.node.shutdown();
    b.node.shutdown();
}

/// Policy used by the two-phase rejection scenario: refuses proposals
/// from one named node.
struct DenyNodeByName(&'static str);

impl SchedulePolicy for DenyNodeByName {
    fn name(&self) -> &str {
        "deny-node"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> PolicyDecision {
        if ctx.node_name == self.0 {
            PolicyDecision::Reject {
                policy: self.name().to_string(),
                reason: format!("node {} is deny-listed", ctx.node_name),
            }
        } else {
            PolicyDecision::Accept
        }
    }
}

#[tokio::test]
async fn policy_rejection_falls_through_to_the_next_proposal() {
    let policies = PolicyChain::new().with(Box::new(DenyNodeByName("node-denied")));
    let a = start_node_with_policies("node-a", "dom-s6", 100, policies).await;
    // The denied node ranks first on headroom.
    let b = start_node("node-denied", "dom-s6", 16_000).await;
    let c = start_node("node-c", "dom-s6", 8000).await;
    introduce(&a, &b).await;
    introduce(&a, &c).await;

    let reply = a.node.deploy(deploy_request(4000)).await;
    assert!(reply.success, "{:?}", reply.error);
    let provider_id = reply.provider_id.unwrap();
    assert!(
        provider_id.ends_with(&format!("@{}", c.node.node_id())),
        "unexpected provider binding {provider_id}"
    );

    // The rejected node never saw a commit.
    assert_eq!(b.node.providers().aggregate_capacity().await.used.cpu, 0);
    assert!(b.node.scheduler().components().is_empty());
    assert_eq!(c.node.providers().aggregate_capacity().await.used.cpu, 4000);

    a.node.shutdown();
    b.node.shutdown();
    c.node.shutdown();
}

#[tokio::test]
async fn stale_peer_headroom_surfaces_as_capacity_exhaustion() {
    let a = start_node("node-a", "dom-stale", 100).await;
    let b = start_node("node-b", "dom-stale", 8000).await;
    introduce(&a, &b).await;

    // B fills up after A last heard from it, so A's view is stale.
    let fill = b.node.deploy(deploy_request(6000)).await;
    assert!(fill.success, "{:?}", fill.error);

    // A delegates on its stale view; B's proposal declines with the
    // canonical capacity message, and the composite keeps that kind
    // so an upstream delegator would gate on it too.
    let err = a
        .node
        .coordinator()
        .deploy_component(deploy_request(4000))
        .await
        .unwrap_err();
    assert!(err.is_capacity_exhausted(), "unexpected kind: {err}");
    let message = err.to_string();
    assert!(message.contains("local:"));
    assert!(message.contains("peer:"));

    a.node.shutdown();
    b.node.shutdown();
}

#[tokio::test]
async fn non_capacity_peer_failures_keep_their_own_kind() {
    let policies = PolicyChain::new().with(Box::new(DenyNodeByName("node-vetoed")));
    let a = start_node_with_policies("node-a", "dom-veto", 100, policies).await;
    let b = start_node("node-vetoed", "dom-veto", 8000).await;
    introduce(&a, &b).await;

    // The only peer is rejected by policy, not by capacity, so the
    // composite must not read as exhaustion.
    let err = a
        .node
        .coordinator()
        .deploy_component(deploy_request(4000))
        .await
        .unwrap_err();
    assert!(!err.is_capacity_exhausted(), "unexpected kind: {err}");
    assert!(err.to_string().contains("[deny-node]"));

    a.node.shutdown();
    b.node.shutdown();
}

#[tokio::test]
async fn targeted_deploys_are_forwarded_to_the_named_node() {
    let a = start_node("node-a", "dom-target", 8000).await;
    let b = start_node("node-b", "dom-target", 8000).await;
    introduce(&a, &b).await;

    let mut request = deploy_request(1000);
    request.target_node_id = Some(b.node.node_id().to_string());
    let reply = a.node.deploy(request).await;
    assert!(reply.success, "{:?}", reply.error);
    assert_eq!(reply.node_id.as_deref().unwrap(), b.node.node_id());
    assert!(reply.provider_id.as_deref().unwrap().starts_with("local."));
    assert_eq!(b.node.providers().aggregate_capacity().await.used.cpu, 1000);
    // The pinned placement executed on B; A only brokered it.
    assert_eq!(a.node.providers().aggregate_capacity().await.used.cpu, 0);

    a.node.shutdown();
    b.node.shutdown();
}

#[tokio::test]
async fn objects_round_trip_through_a_remote_store() {
    let a = start_node("node-a", "dom-store", 1000).await;

    let store = StoreClient::new(a.node.rpc_addr().to_string(), RpcClient::new());
    let object = EncodedObject {
        id: "obj-remote".to_string(),
        data: b"{\"answer\":42}".to_vec(),
        language: Language::Json,
        is_stream: false,
    };

    let reference = store.save_object(object.clone()).await.unwrap();
    assert_eq!(store.get_object(&reference).await.unwrap().data, object.data);

    // Duplicate saves are absorbed, not errors.
    store.save_object(object).await.unwrap();

    // Stream chunks keep their offsets across the wire.
    assert_eq!(store.save_stream_chunk("s1", b"alpha".to_vec()).await.unwrap(), 0);
    assert_eq!(store.save_stream_chunk("s1", b"beta".to_vec()).await.unwrap(), 1);
    assert_eq!(store.get_stream_chunk("s1", 1).await.unwrap(), b"beta");

    let remote_id = store.remote_store_id().await.unwrap();
    assert_eq!(remote_id, a.node.store().store_id());

    a.node.shutdown();
}

#[tokio::test]
async fn gossip_carries_provider_capacity_to_peers() {
    let a = start_node("node-a", "dom-view", 1000).await;
    let b = start_node("node-b", "dom-view", 6000).await;
    introduce(&a, &b).await;

    let seen = a
        .node
        .discovery()
        .manager()
        .node_by_id(b.node.node_id())
        .expect("peer record");
    let capacity = seen.capacity.expect("peer capacity");
    assert_eq!(capacity.total.cpu, 6000);
    assert!(seen.capability_tags.unwrap().cpu);

    a.node.shutdown();
    b.node.shutdown();
}
