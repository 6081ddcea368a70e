//! Staged pipeline driver.
//!
//! A cloner is a list of named [Stage]s run in order by [run_stages].  Every stage says how the
//! pipeline goes on with an [AfterStage], its error (if any) is classified into a
//! [StageResult] at the stage boundary.

use tracing::{debug, info, warn};

use crate::error::{CloneError, Result};

/// What a successful stage asks the driver to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterStage {
    /// run the next stage.
    Continue,
    /// don't run any later stage, the clone is complete.
    SkipRemaining,
}

/// Classified outcome of one stage run.
#[derive(Debug)]
pub enum StageResult {
    /// run the next stage.
    Continue,
    /// don't run any later stage, the clone is complete.
    SkipRemaining,
    /// the collection was dropped on the donor, stop cleanly.
    NotFoundClean,
    /// stop with this error.
    Fatal(CloneError),
}

impl From<Result<AfterStage>> for StageResult {
    fn from(result: Result<AfterStage>) -> Self {
        match result {
            Ok(AfterStage::Continue) => StageResult::Continue,
            Ok(AfterStage::SkipRemaining) => StageResult::SkipRemaining,
            Err(e) if e.is_namespace_not_found() => StageResult::NotFoundClean,
            Err(e) => StageResult::Fatal(e),
        }
    }
}

/// How a whole pipeline ended, when it didn't fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneOutcome {
    /// every stage ran, or a stage legitimately skipped the rest.
    Success,
    /// the collection disappeared from the donor while cloning.
    DroppedCleanly,
}

/// A named step of a cloner.
pub struct Stage<C> {
    /// stage name, used in logs and error context.
    pub name: &'static str,
    /// the stage body.
    pub run: fn(&mut C) -> Result<AfterStage>,
}

/// A cloner the generic driver can run.
pub trait StagedCloner: Sized + 'static {
    /// stages, in execution order.
    const STAGES: &'static [Stage<Self>];

    /// runs once before the first stage.
    fn pre_stage(&mut self) {}

    /// runs once after the last stage, also when the pipeline fails.
    fn post_stage(&mut self) {}

    /// wait until every asynchronous unit of work scheduled by the stages finished.
    fn wait_for_database_work(&self) -> Result<()>;

    /// should the pipeline stop before its next blocking step?
    fn must_exit(&self) -> bool;

    /// (namespace, tenant id), attached to every failure leaving the pipeline.
    fn context(&self) -> (String, String);
}

/// Run every stage of `cloner` in order.
///
/// Outstanding database work is drained before any early exit, so nothing scheduled by this
/// cloner outlives the call.
pub fn run_stages<C: StagedCloner>(cloner: &mut C) -> Result<CloneOutcome> {
    cloner.pre_stage();
    let outcome = drive(cloner);
    cloner.post_stage();
    outcome
}

fn drive<C: StagedCloner>(cloner: &mut C) -> Result<CloneOutcome> {
    for stage in C::STAGES {
        let (ns, tenant_id) = cloner.context();
        if cloner.must_exit() {
            info!(stage = stage.name, namespace = %ns, tenant_id = %tenant_id, "Cloner asked to exit before stage.");
            cloner
                .wait_for_database_work()
                .map_err(|e| e.in_stage(stage.name, &ns, &tenant_id))?;
            return Err(CloneError::Cancelled.in_stage(stage.name, &ns, &tenant_id));
        }

        debug!(stage = stage.name, namespace = %ns, tenant_id = %tenant_id, "Cloner running stage.");
        match StageResult::from((stage.run)(cloner)) {
            StageResult::Continue => {}
            StageResult::SkipRemaining => {
                debug!(stage = stage.name, namespace = %ns, "Stage skips remaining stages.");
                return Ok(CloneOutcome::Success);
            }
            StageResult::NotFoundClean => {
                info!(
                    stage = stage.name,
                    namespace = %ns,
                    tenant_id = %tenant_id,
                    "Tenant collection cloner stopped because collection was dropped on the donor."
                );
                cloner
                    .wait_for_database_work()
                    .map_err(|e| e.in_stage(stage.name, &ns, &tenant_id))?;
                return Ok(CloneOutcome::DroppedCleanly);
            }
            StageResult::Fatal(e) => {
                // the stage error wins over a drain failure.
                if let Err(drain_err) = cloner.wait_for_database_work() {
                    warn!(stage = stage.name, namespace = %ns, tenant_id = %tenant_id, ?drain_err, "Outstanding database work failed while stopping on a stage failure.");
                }
                return Err(e.in_stage(stage.name, &ns, &tenant_id));
            }
        }
    }
    Ok(CloneOutcome::Success)
}
