//! The rate-limited eviction queue
//!
//! Each pod gets its own exponential backoff (100ms to 10s). A 404 means
//! the pod is already gone and counts as success; a 429 means a disruption
//! budget refused the eviction and the pod is requeued, with a deduped
//! `NodeFailedToDrain` event so operators see a stuck drain.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use gantry_common::events::{actions, reasons, EventPublisher};
use gantry_common::{metrics, Result};
use gantry_scheduling::pod_key;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(10);
const DRAIN_EVENT_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Result of one eviction call, mapped from the API response
#[derive(Clone, Debug, PartialEq)]
pub enum EvictionResponse {
    /// 200: the pod is being evicted
    Evicted,
    /// 404: the pod is already gone
    Gone,
    /// 429: a pod disruption budget refused
    Blocked,
    /// 5xx and transport errors
    Failed(String),
}

/// The eviction subresource, trait-seamed for tests
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EvictionClient: Send + Sync {
    /// Create an eviction for the pod
    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictionResponse>;
}

/// Production implementation against the eviction subresource
pub struct KubeEvictionClient {
    client: kube::Client,
}

impl KubeEvictionClient {
    /// Wrap a kube client
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EvictionClient for KubeEvictionClient {
    async fn evict(&self, namespace: &str, name: &str) -> Result<EvictionResponse> {
        let api: kube::Api<Pod> = kube::Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &Default::default()).await {
            Ok(_) => Ok(EvictionResponse::Evicted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(EvictionResponse::Gone),
            Err(kube::Error::Api(ae)) if ae.code == 429 => Ok(EvictionResponse::Blocked),
            Err(e) => Ok(EvictionResponse::Failed(e.to_string())),
        }
    }
}

struct PodBackoff {
    attempts: u32,
    next_attempt: Instant,
}

/// Per-pod rate-limited eviction
pub struct EvictionQueue {
    client: Arc<dyn EvictionClient>,
    events: Arc<dyn EventPublisher>,
    backoff: DashMap<String, PodBackoff>,
    drain_events: DashMap<String, Instant>,
}

impl EvictionQueue {
    /// Wire up the queue
    pub fn new(client: Arc<dyn EvictionClient>, events: Arc<dyn EventPublisher>) -> Self {
        Self {
            client,
            events,
            backoff: DashMap::new(),
            drain_events: DashMap::new(),
        }
    }

    /// Attempt to evict each pod whose backoff has elapsed
    ///
    /// Returns how many pods are confirmed gone or evicting. Pods still
    /// blocked or backing off stay queued for the next pass.
    pub async fn evict_pods(&self, node_name: &str, pods: &[&Pod]) -> usize {
        let mut progressed = 0usize;
        for pod in pods {
            let key = pod_key(pod);
            if let Some(entry) = self.backoff.get(&key) {
                if entry.next_attempt > Instant::now() {
                    continue;
                }
            }
            let namespace = pod.metadata.namespace.as_deref().unwrap_or("default");
            let name = pod.metadata.name.as_deref().unwrap_or("");
            match self.client.evict(namespace, name).await {
                Ok(EvictionResponse::Evicted) => {
                    debug!(pod = %key, "Evicted pod");
                    metrics::EVICTIONS.add(1, &[KeyValue::new("outcome", "evicted")]);
                    let reference = k8s_openapi::api::core::v1::ObjectReference {
                        kind: Some("Pod".into()),
                        name: pod.metadata.name.clone(),
                        namespace: pod.metadata.namespace.clone(),
                        uid: pod.metadata.uid.clone(),
                        ..Default::default()
                    };
                    self.events
                        .publish(
                            &reference,
                            EventType::Normal,
                            reasons::EVICTED,
                            actions::TERMINATE,
                            Some(format!("evicted for node {node_name} drain")),
                        )
                        .await;
                    self.backoff.remove(&key);
                    progressed += 1;
                }
                Ok(EvictionResponse::Gone) => {
                    metrics::EVICTIONS.add(1, &[KeyValue::new("outcome", "gone")]);
                    self.backoff.remove(&key);
                    progressed += 1;
                }
                Ok(EvictionResponse::Blocked) => {
                    metrics::EVICTIONS.add(1, &[KeyValue::new("outcome", "pdb_blocked")]);
                    self.requeue(&key);
                    self.report_stuck_drain(node_name, &key).await;
                }
                Ok(EvictionResponse::Failed(message)) => {
                    warn!(pod = %key, error = %message, "Eviction failed");
                    metrics::EVICTIONS.add(1, &[KeyValue::new("outcome", "error")]);
                    self.requeue(&key);
                }
                Err(e) => {
                    warn!(pod = %key, error = %e, "Eviction call failed");
                    self.requeue(&key);
                }
            }
        }
        progressed
    }

    fn requeue(&self, key: &str) {
        let mut entry = self.backoff.entry(key.to_string()).or_insert(PodBackoff {
            attempts: 0,
            next_attempt: Instant::now(),
        });
        entry.attempts += 1;
        let delay = BASE_DELAY
            .saturating_mul(2u32.saturating_pow(entry.attempts.min(16)))
            .min(MAX_DELAY);
        entry.next_attempt = Instant::now() + delay;
    }

    /// Forget every pod queued for a node (called once the node is gone)
    pub fn clear_node(&self, node_name: &str, pods: &[&Pod]) {
        for pod in pods {
            self.backoff.remove(&pod_key(pod));
        }
        self.drain_events.remove(node_name);
    }

    async fn report_stuck_drain(&self, node_name: &str, pod: &str) {
        let due = self
            .drain_events
            .get(node_name)
            .map(|at| at.elapsed() >= DRAIN_EVENT_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.drain_events
            .insert(node_name.to_string(), Instant::now());
        let reference = k8s_openapi::api::core::v1::ObjectReference {
            kind: Some("Node".into()),
            name: Some(node_name.to_string()),
            ..Default::default()
        };
        self.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::FAILED_DRAINING,
                actions::TERMINATE,
                Some(format!("evicting pod {pod} violates a disruption budget")),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_common::events::NoopEventPublisher;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.into()),
                namespace: Some("default".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn queue(client: MockEvictionClient) -> EvictionQueue {
        EvictionQueue::new(Arc::new(client), Arc::new(NoopEventPublisher))
    }

    #[tokio::test]
    async fn successful_evictions_progress() {
        let mut client = MockEvictionClient::new();
        client
            .expect_evict()
            .times(2)
            .returning(|_, _| Ok(EvictionResponse::Evicted));
        let q = queue(client);
        let pods = [pod("a"), pod("b")];
        let refs: Vec<&Pod> = pods.iter().collect();
        assert_eq!(q.evict_pods("node-1", &refs).await, 2);
    }

    #[tokio::test]
    async fn gone_pods_count_as_success() {
        let mut client = MockEvictionClient::new();
        client
            .expect_evict()
            .returning(|_, _| Ok(EvictionResponse::Gone));
        let q = queue(client);
        let pods = [pod("a")];
        let refs: Vec<&Pod> = pods.iter().collect();
        assert_eq!(q.evict_pods("node-1", &refs).await, 1);
    }

    #[tokio::test]
    async fn blocked_pods_back_off_and_retry_later() {
        let mut client = MockEvictionClient::new();
        client
            .expect_evict()
            .times(1)
            .returning(|_, _| Ok(EvictionResponse::Blocked));
        let q = queue(client);
        let pods = [pod("guarded")];
        let refs: Vec<&Pod> = pods.iter().collect();
        assert_eq!(q.evict_pods("node-1", &refs).await, 0);
        // immediately retried: still inside the backoff window, no new call
        assert_eq!(q.evict_pods("node-1", &refs).await, 0);
    }

    #[tokio::test]
    async fn deleting_the_pod_out_of_band_unblocks_the_drain() {
        let mut client = MockEvictionClient::new();
        let mut first = true;
        client.expect_evict().times(2).returning(move |_, _| {
            if first {
                first = false;
                Ok(EvictionResponse::Blocked)
            } else {
                Ok(EvictionResponse::Gone)
            }
        });
        let q = queue(client);
        let pods = [pod("guarded")];
        let refs: Vec<&Pod> = pods.iter().collect();
        assert_eq!(q.evict_pods("node-1", &refs).await, 0);

        // wait out the backoff, then the pod is gone (deleted out-of-band)
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(q.evict_pods("node-1", &refs).await, 1);
    }

    #[tokio::test]
    async fn clear_node_resets_backoff() {
        let mut client = MockEvictionClient::new();
        client
            .expect_evict()
            .times(2)
            .returning(|_, _| Ok(EvictionResponse::Blocked));
        let q = queue(client);
        let pods = [pod("guarded")];
        let refs: Vec<&Pod> = pods.iter().collect();
        q.evict_pods("node-1", &refs).await;
        q.clear_node("node-1", &refs);
        // backoff was dropped: the next pass calls again right away
        q.evict_pods("node-1", &refs).await;
    }
}
