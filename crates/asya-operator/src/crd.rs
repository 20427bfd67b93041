// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `AsyncActor` custom resource.

use chrono::Utc;
use k8s_openapi::api::core::v1::{PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition types recorded on the actor status.
pub const CONDITION_TRANSPORT_READY: &str = "TransportReady";
/// Queue provisioning condition.
pub const CONDITION_QUEUE_READY: &str = "QueueReady";
/// Workload rendering condition.
pub const CONDITION_WORKLOAD_READY: &str = "WorkloadReady";
/// Autoscaler rendering condition.
pub const CONDITION_SCALING_READY: &str = "ScalingReady";

/// Declarative description of one actor.
///
/// The actor's metadata name doubles as its step name: the queue it
/// consumes is derived from it with the operator-wide prefix.
#[derive(CustomResource, Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "asya.sh",
    version = "v1alpha1",
    kind = "AsyncActor",
    namespaced,
    status = "AsyncActorStatus",
    shortname = "actor",
    printcolumn = r#"{"name":"Transport","type":"string","jsonPath":".spec.transport"}"#,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".spec.workload.kind"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"WorkloadReady\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AsyncActorSpec {
    /// Name of a transport from the operator configuration.
    pub transport: String,

    /// Workload shape and pod template for the user containers.
    #[serde(default)]
    pub workload: WorkloadSpec,

    /// Queue-depth autoscaling policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaling: Option<ScalingSpec>,

    /// Sidecar container overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sidecar: Option<SidecarOverrides>,

    /// IPC socket settings shared by sidecar and user containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket: Option<SocketSpec>,

    /// Timeout settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeouts: Option<TimeoutSpec>,

    /// Gateway base URL; enables progress heartbeats when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,
}

/// Which kind of workload carries the actor pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, JsonSchema)]
pub enum WorkloadKind {
    /// Long-running, freely rescheduled pods.
    #[default]
    Deployment,
    /// Stable pod identities.
    StatefulSet,
    /// One-shot batch run.
    Job,
}

/// Workload shape for one actor.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Workload kind to render.
    #[serde(default)]
    pub kind: WorkloadKind,

    /// Replica count. Informational once autoscaling is enabled; the
    /// scaler owns the live count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template holding the user containers. The operator injects the
    /// sidecar, volumes and environment on top of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

/// Queue-depth autoscaling policy (rendered as a KEDA ScaledObject).
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScalingSpec {
    /// Master switch.
    #[serde(default)]
    pub enabled: bool,

    /// Lower replica bound (0 allows scale-to-zero).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper replica bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,

    /// Target queue depth per replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_length: Option<i64>,

    /// Seconds between queue-depth samples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<i32>,

    /// Seconds of quiet before scaling back down.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_period: Option<i32>,
}

/// Sidecar container overrides.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SidecarOverrides {
    /// Image overriding the operator-wide default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Image pull policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,

    /// Resource requests/limits for the sidecar container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
}

/// IPC socket settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SocketSpec {
    /// Socket path inside both containers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Frame size cap in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<i64>,
}

/// Timeout settings, in humantime form (`"5m"`, `"90s"`).
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutSpec {
    /// Sidecar-owned handler deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    /// In-flight drain budget on shutdown; also the pod's termination
    /// grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graceful_shutdown: Option<String>,
}

/// Observed state of one actor.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AsyncActorStatus {
    /// Generation the controller last acted on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Name of the rendered workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<String>,

    /// Name of the rendered ScaledObject, when scaling is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scaled_object_ref: Option<String>,

    /// Per-subsystem readiness conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Build a status condition with the standard fields filled in.
pub fn condition(
    type_: &str,
    ok: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: if ok { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.into(),
        observed_generation,
        last_transition_time: Time(Utc::now()),
    }
}

/// Merge a condition into a set, replacing any existing one of the same
/// type but keeping its transition time when the status did not flip.
pub fn upsert_condition(conditions: &mut Vec<Condition>, next: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == next.type_) {
        let transition = if existing.status == next.status {
            existing.last_transition_time.clone()
        } else {
            next.last_transition_time.clone()
        };
        *existing = Condition {
            last_transition_time: transition,
            ..next
        };
    } else {
        conditions.push(next);
    }
}
