use crate::context::Context;
use crate::errors::{Error, Result};
use crate::events::EventSink;
use crate::ownership::OwnershipGuard;
use crate::project::Project;
use crate::reconciler::{run_cleanup, run_reconcile};
use crate::status;

use chrono::Utc;
use futures::StreamExt;
use kube::{
    api::{ListParams, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as Finalizer},
        watcher,
    },
};
use lazy_static::lazy_static;
use std::sync::Arc;
use tokio::time::Duration;
use tracing::{error, info, warn};

pub static PROJECT_FINALIZER: &str = "projects.rancher.devops.io";

lazy_static! {
    static ref RECONCILIATION_INTERVAL: Duration = Duration::from_secs(5 * 60);
}

/// Reconciliation loop of the Project controller.
async fn reconcile(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    info!("Reconciling Project \"{}\"", project.name_any());

    let projects = ctx.projects_api();
    finalizer(&projects, PROJECT_FINALIZER, project, |event| async {
        match event {
            Finalizer::Apply(project) => apply(project, ctx.clone()).await,
            Finalizer::Cleanup(project) => cleanup(project, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

async fn apply(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action> {
    let mut cr = (*project).clone();
    let projects = ctx.projects_api();

    // fresh claims snapshot for this pass; loads empty on list errors
    let guard = OwnershipGuard::load(&projects).await;
    let sink = EventSink::new(ctx.recorder(&cr).await);

    // the reconciler persists any observe-imported spec through `projects`
    // itself, mid-pass; only the status write is left to this caller
    match run_reconcile(
        &mut cr,
        ctx.rancher.as_ref(),
        &guard,
        &projects,
        &ctx.settings,
        &sink,
        &ctx.metrics,
    )
    .await
    {
        Ok(()) => {
            status::update_status(&projects, &cr).await?;
            Ok(Action::requeue(*RECONCILIATION_INTERVAL))
        }
        Err(e) => {
            // the status already carries phase=Error and the message
            if let Err(write_error) = status::update_status(&projects, &cr).await {
                warn!(
                    project = cr.name_any(),
                    error = ?write_error,
                    "cannot record error status"
                );
            }
            Err(e)
        }
    }
}

async fn cleanup(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action> {
    let sink = EventSink::new(ctx.recorder(&project).await);
    run_cleanup(
        &project,
        ctx.rancher.as_ref(),
        &ctx.settings,
        &sink,
        &ctx.metrics,
    )
    .await?;
    Ok(Action::await_change())
}

/// Error function called when the controller cannot run the reconciliation
/// loop
fn error_policy(project: Arc<Project>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(project = project.name_any(), "reconcile failed: {error:?}");
    Action::requeue(*RECONCILIATION_INTERVAL)
}

/// Initialize the controller (given the CRD is installed)
pub async fn run(ctx: Arc<Context>) {
    let projects = ctx.projects_api();
    if let Err(e) = projects.list(&ListParams::default().limit(1)).await {
        error!("Project CRD is not queryable; {e:?}. Is the CRD installed?");
        std::process::exit(1);
    }

    Controller::new(projects, watcher::Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
