// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `AsyncActor` control loop.

use crate::builder::{self, RenderedWorkload};
use crate::config::{OperatorConfig, TransportEntry};
use crate::crd::{
    AsyncActor, AsyncActorStatus, CONDITION_QUEUE_READY, CONDITION_SCALING_READY,
    CONDITION_TRANSPORT_READY, CONDITION_WORKLOAD_READY, WorkloadKind, condition,
    upsert_condition,
};
use crate::queues::QueueProvisioner;
use crate::runtime_configmap::{RuntimeScriptError, ensure_configmap};
use crate::scaler::{render_scaled_object, render_trigger_auth, trigger_auth_name};
use crate::scaler::{ScaledObject, TriggerAuthentication};
use asya_core::QueueNaming;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Finalizer guarding queue and scaler teardown.
pub const FINALIZER: &str = "asya.sh/finalizer";

const FIELD_MANAGER: &str = "asya-operator";

/// Steady-state resync interval.
const STEADY_REQUEUE: Duration = Duration::from_secs(300);
/// First retry delay after a failure; doubles per consecutive failure.
const BASE_BACKOFF: Duration = Duration::from_secs(5);
/// Backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Errors surfaced to the controller's error policy.
#[derive(Debug, Error)]
pub enum Error {
    /// The actor object has no namespace (cluster-scoped apply bug).
    #[error("actor has no namespace")]
    MissingNamespace,

    /// `spec.transport` names nothing in the operator config.
    #[error("unknown transport '{0}'")]
    UnknownTransport(String),

    /// Queue provisioning failed.
    #[error("queue provisioning failed: {0}")]
    Queue(#[from] asya_transport::TransportError),

    /// Workload rendering failed.
    #[error(transparent)]
    Build(#[from] builder::BuildError),

    /// Runtime script distribution failed.
    #[error(transparent)]
    Script(#[from] RuntimeScriptError),

    /// Kubernetes API failure.
    #[error(transparent)]
    Kube(#[from] kube::Error),

    /// Finalizer bookkeeping failed.
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Shared state handed to every reconcile invocation.
pub struct Context {
    /// Kubernetes client.
    pub client: Client,
    /// Operator-wide configuration.
    pub config: Arc<OperatorConfig>,
    /// Broker-connection cache for queue lifecycle.
    pub queues: QueueProvisioner,
    /// Runtime script content, loaded at startup.
    pub runtime_script: String,
    /// Consecutive-failure counters keyed by `namespace/name`.
    backoff: Mutex<HashMap<String, u32>>,
}

impl Context {
    /// Assemble the controller context.
    pub fn new(client: Client, config: Arc<OperatorConfig>, runtime_script: String) -> Self {
        Self {
            client,
            config,
            queues: QueueProvisioner::new(),
            runtime_script,
            backoff: Mutex::new(HashMap::new()),
        }
    }

    fn backoff_key(actor: &AsyncActor) -> String {
        format!(
            "{}/{}",
            actor.namespace().unwrap_or_default(),
            actor.name_any()
        )
    }

    fn next_backoff(&self, actor: &AsyncActor) -> Duration {
        let mut counters = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        let attempts = counters.entry(Self::backoff_key(actor)).or_insert(0);
        *attempts = attempts.saturating_add(1);
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(16));
        (BASE_BACKOFF * factor).min(MAX_BACKOFF)
    }

    fn reset_backoff(&self, actor: &AsyncActor) {
        let mut counters = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        counters.remove(&Self::backoff_key(actor));
    }
}

/// Top-level reconcile: finalizer bookkeeping around apply/cleanup.
pub async fn reconcile(actor: Arc<AsyncActor>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = actor.namespace().ok_or(Error::MissingNamespace)?;
    let api: Api<AsyncActor> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, actor, |event| async {
        match event {
            FinalizerEvent::Apply(actor) => apply(&actor, &ctx).await,
            FinalizerEvent::Cleanup(actor) => cleanup(&actor, &ctx).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

/// Error policy: exponential backoff per object.
pub fn error_policy(actor: Arc<AsyncActor>, error: &Error, ctx: Arc<Context>) -> Action {
    let delay = ctx.next_backoff(&actor);
    warn!(
        actor = %actor.name_any(),
        error = %error,
        retry_in = ?delay,
        "reconcile failed"
    );
    Action::requeue(delay)
}

async fn apply(actor: &AsyncActor, ctx: &Context) -> Result<Action, Error> {
    let name = actor.name_any();
    let namespace = actor.namespace().ok_or(Error::MissingNamespace)?;
    let generation = actor.metadata.generation;
    let mut conditions = actor
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    let mut status = AsyncActorStatus {
        observed_generation: generation,
        ..actor.status.clone().unwrap_or_default()
    };

    // 1. Transport resolution.
    let entry = match ctx.config.transport(&actor.spec.transport) {
        Some(entry) => {
            upsert_condition(
                &mut conditions,
                condition(
                    CONDITION_TRANSPORT_READY,
                    true,
                    "Resolved",
                    format!("transport '{}' resolved", actor.spec.transport),
                    generation,
                ),
            );
            entry.clone()
        }
        None => {
            upsert_condition(
                &mut conditions,
                condition(
                    CONDITION_TRANSPORT_READY,
                    false,
                    "UnknownTransport",
                    format!(
                        "transport '{}' is not in the operator configuration",
                        actor.spec.transport
                    ),
                    generation,
                ),
            );
            status.conditions = conditions;
            patch_status(ctx, &namespace, &name, &status).await?;
            return Err(Error::UnknownTransport(actor.spec.transport.clone()));
        }
    };

    // 2. Queue provisioning.
    let queue = QueueNaming::with_prefix(ctx.config.queue_prefix.clone()).queue_for(&name);
    if let Err(e) = ctx
        .queues
        .ensure(&actor.spec.transport, &entry, &queue)
        .await
    {
        upsert_condition(
            &mut conditions,
            condition(
                CONDITION_QUEUE_READY,
                false,
                "DeclareFailed",
                e.to_string(),
                generation,
            ),
        );
        status.conditions = conditions;
        patch_status(ctx, &namespace, &name, &status).await?;
        return Err(e.into());
    }
    upsert_condition(
        &mut conditions,
        condition(
            CONDITION_QUEUE_READY,
            true,
            "Declared",
            format!("queue '{queue}' ensured"),
            generation,
        ),
    );

    // 3. Cloud identity, when the transport asks for it.
    ensure_service_account(ctx, &namespace, &name, &entry).await?;

    // 4. The runtime script must be mountable from the actor's namespace.
    if namespace != ctx.config.runtime_namespace {
        ensure_configmap(ctx.client.clone(), &namespace, &ctx.runtime_script).await?;
    }

    // 5. Workload rendering and apply.
    let owner = actor.controller_owner_ref(&());
    let rendered = match builder::render_workload(actor, &ctx.config, &entry, owner.clone()) {
        Ok(rendered) => rendered,
        Err(e) => {
            upsert_condition(
                &mut conditions,
                condition(
                    CONDITION_WORKLOAD_READY,
                    false,
                    "RenderFailed",
                    e.to_string(),
                    generation,
                ),
            );
            status.conditions = conditions;
            patch_status(ctx, &namespace, &name, &status).await?;
            return Err(e.into());
        }
    };
    apply_workload(ctx, &namespace, &name, &rendered).await?;
    status.workload_ref = Some(rendered.name());
    upsert_condition(
        &mut conditions,
        condition(
            CONDITION_WORKLOAD_READY,
            true,
            "Applied",
            format!("{:?} '{}' applied", actor.spec.workload.kind, rendered.name()),
            generation,
        ),
    );

    // 6. Autoscaling objects.
    let scaling = actor.spec.scaling.as_ref().filter(|s| s.enabled);
    match scaling {
        Some(policy) => {
            let kind = match actor.spec.workload.kind {
                WorkloadKind::Deployment => "Deployment",
                WorkloadKind::StatefulSet => "StatefulSet",
                // KEDA cannot scale a one-shot Job's replica count.
                WorkloadKind::Job => {
                    upsert_condition(
                        &mut conditions,
                        condition(
                            CONDITION_SCALING_READY,
                            false,
                            "UnsupportedWorkload",
                            "scaling requires a Deployment or StatefulSet",
                            generation,
                        ),
                    );
                    status.conditions = conditions.clone();
                    patch_status(ctx, &namespace, &name, &status).await?;
                    ctx.reset_backoff(actor);
                    return Ok(Action::requeue(STEADY_REQUEUE));
                }
            };
            if let Some(auth) = render_trigger_auth(actor, &entry, owner.clone()) {
                let api: Api<TriggerAuthentication> =
                    Api::namespaced(ctx.client.clone(), &namespace);
                server_side_apply(&api, &trigger_auth_name(&name), &auth).await?;
            }
            let scaled = render_scaled_object(actor, policy, &entry, &queue, kind, owner);
            let api: Api<ScaledObject> = Api::namespaced(ctx.client.clone(), &namespace);
            server_side_apply(&api, &name, &scaled).await?;
            status.scaled_object_ref = Some(name.clone());
            upsert_condition(
                &mut conditions,
                condition(
                    CONDITION_SCALING_READY,
                    true,
                    "Applied",
                    format!("scaledobject '{name}' applied"),
                    generation,
                ),
            );
        }
        None => {
            delete_ignoring_missing::<ScaledObject>(ctx, &namespace, &name).await?;
            delete_ignoring_missing::<TriggerAuthentication>(
                ctx,
                &namespace,
                &trigger_auth_name(&name),
            )
            .await?;
            status.scaled_object_ref = None;
            upsert_condition(
                &mut conditions,
                condition(
                    CONDITION_SCALING_READY,
                    true,
                    "Disabled",
                    "autoscaling not enabled",
                    generation,
                ),
            );
        }
    }

    status.conditions = conditions;
    patch_status(ctx, &namespace, &name, &status).await?;
    ctx.reset_backoff(actor);
    info!(actor = %name, namespace = %namespace, "reconciled");
    Ok(Action::requeue(STEADY_REQUEUE))
}

async fn cleanup(actor: &AsyncActor, ctx: &Context) -> Result<Action, Error> {
    let name = actor.name_any();
    let namespace = actor.namespace().ok_or(Error::MissingNamespace)?;

    delete_ignoring_missing::<Deployment>(ctx, &namespace, &name).await?;
    delete_ignoring_missing::<StatefulSet>(ctx, &namespace, &name).await?;
    delete_ignoring_missing::<Job>(ctx, &namespace, &name).await?;
    delete_ignoring_missing::<ScaledObject>(ctx, &namespace, &name).await?;
    delete_ignoring_missing::<TriggerAuthentication>(ctx, &namespace, &trigger_auth_name(&name))
        .await?;

    if ctx.config.delete_queues {
        if let Some(entry) = ctx.config.transport(&actor.spec.transport) {
            let queue =
                QueueNaming::with_prefix(ctx.config.queue_prefix.clone()).queue_for(&name);
            if let Err(e) = ctx.queues.delete(&actor.spec.transport, entry, &queue).await {
                // Teardown should not wedge on a broker outage; the queue
                // can be removed out of band.
                warn!(queue = %queue, error = %e, "queue deletion failed, continuing");
            }
        }
    }

    info!(actor = %name, namespace = %namespace, "cleaned up");
    Ok(Action::await_change())
}

async fn ensure_service_account(
    ctx: &Context,
    namespace: &str,
    actor_name: &str,
    entry: &TransportEntry,
) -> Result<(), Error> {
    let TransportEntry::Amqp {
        service_account, ..
    } = entry;
    let Some(spec) = service_account else {
        return Ok(());
    };
    let account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            annotations: Some(spec.annotations.clone()),
            labels: Some(builder::labels(actor_name)),
            ..ObjectMeta::default()
        },
        ..ServiceAccount::default()
    };
    let api: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    server_side_apply(&api, &spec.name, &account).await?;
    Ok(())
}

async fn apply_workload(
    ctx: &Context,
    namespace: &str,
    name: &str,
    rendered: &RenderedWorkload,
) -> Result<(), Error> {
    match rendered {
        RenderedWorkload::Deployment(d) => {
            let api: Api<Deployment> = Api::namespaced(ctx.client.clone(), namespace);
            server_side_apply(&api, name, d).await?;
            delete_ignoring_missing::<StatefulSet>(ctx, namespace, name).await?;
            delete_ignoring_missing::<Job>(ctx, namespace, name).await?;
        }
        RenderedWorkload::StatefulSet(s) => {
            let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), namespace);
            server_side_apply(&api, name, s).await?;
            delete_ignoring_missing::<Deployment>(ctx, namespace, name).await?;
            delete_ignoring_missing::<Job>(ctx, namespace, name).await?;
        }
        RenderedWorkload::Job(j) => {
            let api: Api<Job> = Api::namespaced(ctx.client.clone(), namespace);
            server_side_apply(&api, name, j).await?;
            delete_ignoring_missing::<Deployment>(ctx, namespace, name).await?;
            delete_ignoring_missing::<StatefulSet>(ctx, namespace, name).await?;
        }
    }
    Ok(())
}

async fn server_side_apply<K>(api: &Api<K>, name: &str, object: &K) -> Result<(), Error>
where
    K: Clone + Debug + DeserializeOwned + Serialize,
{
    api.patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await?;
    Ok(())
}

async fn delete_ignoring_missing<K>(ctx: &Context, namespace: &str, name: &str) -> Result<(), Error>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + Debug
        + DeserializeOwned,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(ctx.client.clone(), namespace);
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => {
            debug!(name = %name, "deleted");
            Ok(())
        }
        Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn patch_status(
    ctx: &Context,
    namespace: &str,
    name: &str,
    status: &AsyncActorStatus,
) -> Result<(), Error> {
    let api: Api<AsyncActor> = Api::namespaced(ctx.client.clone(), namespace);
    api.patch_status(
        name,
        &PatchParams::default(),
        &Patch::Merge(serde_json::json!({ "status": status })),
    )
    .await?;
    Ok(())
}

/// Watch `AsyncActor`s cluster-wide and drive them to their desired
/// topology until shutdown.
pub async fn run_controller(ctx: Arc<Context>) {
    let actors = Api::<AsyncActor>::all(ctx.client.clone());
    let deployments = Api::<Deployment>::all(ctx.client.clone());
    let statefulsets = Api::<StatefulSet>::all(ctx.client.clone());
    let jobs = Api::<Job>::all(ctx.client.clone());

    Controller::new(actors, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .owns(statefulsets, watcher::Config::default())
        .owns(jobs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((object, _action)) => debug!(object = ?object, "reconcile ok"),
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::AsyncActorSpec;

    fn actor(name: &str, namespace: &str) -> AsyncActor {
        let mut actor = AsyncActor::new(
            name,
            AsyncActorSpec {
                transport: "mq".to_string(),
                ..AsyncActorSpec::default()
            },
        );
        actor.metadata.namespace = Some(namespace.to_string());
        actor
    }

    fn test_context() -> Context {
        let config: OperatorConfig = serde_yaml::from_str(
            r#"
transports:
  mq:
    type: amqp
    url: amqp://localhost
runtimeScript:
  file: /etc/asya/asya-runtime.py
sidecarImage: sidecar:dev
"#,
        )
        .unwrap();
        // A client is required structurally but never dialed in these
        // tests; an inert config pointing nowhere is enough.
        let kubeconfig = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(kubeconfig).unwrap();
        Context::new(client, Arc::new(config), "print('hi')".to_string())
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let ctx = test_context();
        let a = actor("resize", "pipelines");
        assert_eq!(ctx.next_backoff(&a), Duration::from_secs(5));
        assert_eq!(ctx.next_backoff(&a), Duration::from_secs(10));
        assert_eq!(ctx.next_backoff(&a), Duration::from_secs(20));
        for _ in 0..20 {
            ctx.next_backoff(&a);
        }
        assert_eq!(ctx.next_backoff(&a), MAX_BACKOFF);
    }

    #[test]
    fn backoff_resets_on_success() {
        let ctx = test_context();
        let a = actor("resize", "pipelines");
        ctx.next_backoff(&a);
        ctx.next_backoff(&a);
        ctx.reset_backoff(&a);
        assert_eq!(ctx.next_backoff(&a), Duration::from_secs(5));
    }

    #[test]
    fn backoff_is_per_object() {
        let ctx = test_context();
        let a = actor("a", "ns");
        let b = actor("b", "ns");
        ctx.next_backoff(&a);
        ctx.next_backoff(&a);
        assert_eq!(ctx.next_backoff(&b), Duration::from_secs(5));
    }
}
