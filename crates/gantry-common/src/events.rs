//! Kubernetes Event recording for Gantry controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "FailedScheduling")
    /// * `action` - What action was taken (e.g. "Provision")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    client: Client,
    reporter: Reporter,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "gantry-provisioner").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: None,
        };
        Self { client, reporter }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(self.client.clone(), self.reporter.clone(), resource_ref.clone());
        if let Err(e) = recorder.publish(event).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests and simulation mode.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
        // intentionally empty
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// A pending pod could not be scheduled onto any pool
    pub const FAILED_SCHEDULING: &str = "FailedScheduling";
    /// A pod was assigned to an existing or in-flight node
    pub const NOMINATED: &str = "Nominated";
    /// The cloud provider had no capacity for the chosen offering
    pub const INSUFFICIENT_CAPACITY: &str = "InsufficientCapacityError";
    /// A node's drain is blocked, typically by a disruption budget
    pub const FAILED_DRAINING: &str = "NodeFailedToDrain";
    /// A pod was evicted during drain
    pub const EVICTED: &str = "Evicted";
    /// A claim was selected for voluntary disruption
    pub const DISRUPTION_STARTED: &str = "DisruptionStarted";
    /// A proposed disruption failed re-validation and was aborted
    pub const DISRUPTION_ABORTED: &str = "DisruptionAborted";
    /// A disruption candidate was skipped because pods would not reschedule
    pub const DISRUPTION_BLOCKED: &str = "DisruptionBlocked";
}

/// Well-known event action strings.
pub mod actions {
    /// Provisioning new capacity
    pub const PROVISION: &str = "Provision";
    /// Claim lifecycle progression
    pub const LIFECYCLE: &str = "Lifecycle";
    /// Voluntary disruption
    pub const DISRUPT: &str = "Disrupt";
    /// Node drain and teardown
    pub const TERMINATE: &str = "Terminate";
}
