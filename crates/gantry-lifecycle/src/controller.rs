//! The aggregate NodeClaim lifecycle controller
//!
//! Runs the sub-reconcilers in order on every claim event and persists the
//! status once at the end. Each sub-reconciler is idempotent and makes at
//! most one external call per pass, so a crash anywhere converges on the
//! next run.

use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, warn};

use gantry_common::crd::NodeClaim;
use gantry_common::{Error, Result};

use crate::client::LifecycleClient;
use crate::initialization::Initialization;
use crate::launch::Launch;
use crate::liveness::Liveness;
use crate::marking::Marking;
use crate::registration::Registration;

const DEFAULT_REQUEUE: Duration = Duration::from_secs(60);

/// Shared context for the lifecycle controller
pub struct Context {
    /// Launch sub-reconciler
    pub launch: Launch,
    /// Registration sub-reconciler
    pub registration: Registration,
    /// Initialization sub-reconciler
    pub initialization: Initialization,
    /// Liveness sub-reconciler
    pub liveness: Liveness,
    /// Drift/emptiness/expiration marking
    pub marking: Marking,
    /// Store access for the status write
    pub client: Arc<dyn LifecycleClient>,
}

/// Reconcile one claim event
pub async fn reconcile(claim: Arc<NodeClaim>, ctx: Arc<Context>) -> Result<Action> {
    if claim.is_terminating() {
        // teardown belongs to the termination controller
        return Ok(Action::await_change());
    }

    let mut working = (*claim).clone();
    let before = working.status.clone();
    let mut requeue = DEFAULT_REQUEUE;

    let outcome = ctx.launch.reconcile(&mut working).await;
    let outcome = match outcome {
        Ok(o) if o.deleted => return Ok(Action::await_change()),
        Ok(o) => o,
        Err(e) => {
            persist_status(&ctx, &claim, &working, &before).await?;
            return Err(e);
        }
    };
    if let Some(after) = outcome.requeue_after {
        requeue = requeue.min(after);
    }

    let registration = ctx.registration.reconcile(&mut working).await;
    let initialization = match &registration {
        Ok(_) => ctx.initialization.reconcile(&mut working).await,
        Err(_) => Ok(crate::Outcome::default()),
    };
    for step in [registration, initialization] {
        match step {
            Ok(o) => {
                if let Some(after) = o.requeue_after {
                    requeue = requeue.min(after);
                }
            }
            Err(e) => {
                persist_status(&ctx, &claim, &working, &before).await?;
                return Err(e);
            }
        }
    }

    match ctx.liveness.reconcile(&working).await? {
        o if o.deleted => return Ok(Action::await_change()),
        o => {
            if let Some(after) = o.requeue_after {
                requeue = requeue.min(after);
            }
        }
    }

    match ctx.marking.reconcile(&mut working).await {
        Ok(o) => {
            if let Some(after) = o.requeue_after {
                requeue = requeue.min(after);
            }
        }
        Err(e) => warn!(claim = %working.name_any(), error = %e, "Marking pass failed"),
    }

    persist_status(&ctx, &claim, &working, &before).await?;
    debug!(claim = %working.name_any(), requeue_secs = requeue.as_secs(), "Reconciled claim");
    Ok(Action::requeue(requeue))
}

async fn persist_status(
    ctx: &Context,
    _original: &NodeClaim,
    working: &NodeClaim,
    before: &Option<gantry_common::crd::NodeClaimStatus>,
) -> Result<()> {
    if &working.status != before {
        ctx.client.update_claim_status(working).await?;
    }
    Ok(())
}

/// Error policy: retryable errors requeue quickly, the rest back off
pub fn error_policy(claim: Arc<NodeClaim>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(claim = %claim.name_any(), error = %error, "Reconcile error, will retry");
    if error.is_retryable() {
        Action::requeue(Duration::from_secs(10))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
