//! Node-side rank control: the receiving end of the cluster rank RPCs.
//!
//! Each operation acts on the local instances selected by the request's
//! rank set and answers with one [`MemberResult`] per instance. Operations
//! that change process state signal or enqueue first, then poll until the
//! selected instances converge. An expired context is returned unchanged.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use strata_core::{
    Context, GroupMap, LogMasksReq, MemberResult, MemberState, Rank, RankMethod, RanksReq,
    RanksResp,
};
use strata_drpc::{PingRankReq, PrepShutdownReq, SetLogMasksReq};

use crate::error::{EngineError, EngineResult};
use crate::harness::EngineHarness;
use crate::instance::EngineInstance;
use crate::poll::poll_until;
use crate::runner::Signal;

pub struct RankControl {
    harness: Arc<EngineHarness>,
    poll_interval: Duration,
}

impl RankControl {
    pub fn new(harness: Arc<EngineHarness>, poll_interval: Duration) -> Self {
        Self {
            harness,
            poll_interval,
        }
    }

    pub fn harness(&self) -> &Arc<EngineHarness> {
        &self.harness
    }

    pub async fn handle(
        &self,
        ctx: &Context,
        method: RankMethod,
        req: &RanksReq,
    ) -> EngineResult<RanksResp> {
        match method {
            RankMethod::PingRanks => self.ping_ranks(ctx, req).await,
            RankMethod::PrepShutdownRanks => self.prep_shutdown_ranks(ctx, req).await,
            RankMethod::StopRanks => self.stop_ranks(ctx, req).await,
            RankMethod::StartRanks => self.start_ranks(ctx, req).await,
            RankMethod::ResetFormatRanks => self.reset_format_ranks(ctx, req).await,
        }
    }

    pub async fn ping_ranks(&self, ctx: &Context, req: &RanksReq) -> EngineResult<RanksResp> {
        let instances = self.harness.filter_instances_by_rank_set(&req.ranks).await;
        let pings = instances.iter().map(|instance| async move {
            if !instance.is_ready() {
                return Ok(instance.local_result().await);
            }
            let rank = rank_of(instance).await;
            drpc_result(
                rank,
                MemberState::Joined,
                instance.request(ctx, &PingRankReq { rank: rank.get() }).await,
            )
        });
        collect(join_all(pings).await)
    }

    pub async fn prep_shutdown_ranks(
        &self,
        ctx: &Context,
        req: &RanksReq,
    ) -> EngineResult<RanksResp> {
        let instances = self.harness.filter_instances_by_rank_set(&req.ranks).await;
        let preps = instances.iter().map(|instance| async move {
            if !instance.is_ready() {
                return Ok(instance.local_result().await);
            }
            let rank = rank_of(instance).await;
            drpc_result(
                rank,
                MemberState::Stopping,
                instance.request(ctx, &PrepShutdownReq { rank: rank.get() }).await,
            )
        });
        collect(join_all(preps).await)
    }

    /// Signal the selected engines and wait until none of them is running.
    /// `force` kills immediately instead of interrupting.
    pub async fn stop_ranks(&self, ctx: &Context, req: &RanksReq) -> EngineResult<RanksResp> {
        let signal = if req.force { Signal::Kill } else { Signal::Interrupt };
        let instances = self.harness.filter_instances_by_rank_set(&req.ranks).await;

        let mut failed = Vec::new();
        let mut signalled = Vec::new();
        for instance in &instances {
            match instance.stop(signal) {
                Ok(()) => signalled.push(Arc::clone(instance)),
                Err(e) => {
                    warn!(instance = instance.index(), error = %e, "failed to stop engine");
                    failed.push((instance.index(), e.to_string()));
                }
            }
        }
        debug!(?signal, count = signalled.len(), "waiting for engines to stop");

        let signalled = &signalled;
        poll_until(ctx, self.poll_interval, || async move {
            signalled.iter().all(|i| !i.is_started())
        })
        .await?;

        let mut results = Vec::with_capacity(instances.len());
        for instance in &instances {
            match failed.iter().find(|(idx, _)| *idx == instance.index()) {
                Some((_, msg)) => {
                    let rank = rank_of(instance).await;
                    results.push(MemberResult::errored(rank, MemberState::Errored, msg));
                }
                None => results.push(instance.local_result().await),
            }
        }
        Ok(RanksResp { results })
    }

    /// Request a start for every selected engine that is down, then wait
    /// until each is ready or waiting for storage to be formatted.
    pub async fn start_ranks(&self, ctx: &Context, req: &RanksReq) -> EngineResult<RanksResp> {
        let instances = self.harness.filter_instances_by_rank_set(&req.ranks).await;
        for instance in &instances {
            if !instance.is_started() && !instance.is_awaiting_format() {
                instance.request_start(ctx).await?;
            }
        }

        let waiting = &instances;
        poll_until(ctx, self.poll_interval, || async move {
            waiting.iter().all(|i| i.is_ready() || i.is_awaiting_format())
        })
        .await?;

        let mut results = Vec::with_capacity(instances.len());
        for instance in &instances {
            results.push(instance.local_result().await);
        }
        Ok(RanksResp { results })
    }

    /// Remove the superblock of every selected engine and restart it into
    /// the await-format state. Fails without touching anything if one of
    /// them is still started.
    pub async fn reset_format_ranks(
        &self,
        ctx: &Context,
        req: &RanksReq,
    ) -> EngineResult<RanksResp> {
        let instances = self.harness.filter_instances_by_rank_set(&req.ranks).await;
        for instance in &instances {
            if instance.is_started() {
                return Err(EngineError::InstanceStarted {
                    rank: rank_of(instance).await,
                });
            }
        }

        let mut ranks = Vec::with_capacity(instances.len());
        for instance in &instances {
            ranks.push(rank_of(instance).await);
            instance.remove_superblock().await?;
            instance.request_start(ctx).await?;
        }

        let waiting = &instances;
        poll_until(ctx, self.poll_interval, || async move {
            waiting.iter().all(|i| i.is_awaiting_format())
        })
        .await?;
        info!(count = ranks.len(), "engine storage reset; awaiting format");

        Ok(RanksResp {
            results: ranks
                .into_iter()
                .map(|rank| MemberResult::new(rank, MemberState::AwaitFormat))
                .collect(),
        })
    }

    /// Apply log masks to the selected engines. With `reset_masks` each
    /// engine gets its configured mask back; every mask is checked before
    /// any call is made.
    pub async fn set_engine_log_masks(
        &self,
        ctx: &Context,
        req: &LogMasksReq,
    ) -> EngineResult<RanksResp> {
        let instances = self.harness.filter_instances_by_rank_set(&req.ranks).await;

        let mut plan = Vec::with_capacity(instances.len());
        for instance in &instances {
            let masks = if req.reset_masks {
                SetLogMasksReq {
                    masks: instance.log_mask().to_string(),
                    subsystems: String::new(),
                }
            } else {
                SetLogMasksReq {
                    masks: req.masks.clone(),
                    subsystems: req.subsystems.clone(),
                }
            };
            if masks.masks.is_empty() {
                return Err(EngineError::EmptyLogMasks);
            }
            plan.push((Arc::clone(instance), masks));
        }

        let updates = plan.iter().map(|(instance, masks)| async move {
            let rank = rank_of(instance).await;
            if !instance.is_ready() {
                let (state, _) = instance.local_state().await;
                return Ok(MemberResult::errored(
                    rank,
                    state,
                    EngineError::NotReady(instance.index()).to_string(),
                ));
            }
            let state = instance.local_state().await.0;
            drpc_result(rank, state, instance.request(ctx, masks).await)
        });
        collect(join_all(updates).await)
    }

    pub async fn group_update(&self, ctx: &Context, map: &GroupMap) -> EngineResult<()> {
        self.harness.group_update(ctx, map).await
    }
}

async fn rank_of(instance: &EngineInstance) -> Rank {
    instance.rank().await.unwrap_or(Rank::NIL)
}

/// Turn one dRPC outcome into a member result. Context expiry aborts the
/// whole operation; any other failure marks just this rank errored.
fn drpc_result<T>(
    rank: Rank,
    ok_state: MemberState,
    outcome: EngineResult<T>,
) -> EngineResult<MemberResult> {
    match outcome {
        Ok(_) => Ok(MemberResult::new(rank, ok_state)),
        Err(e) => match e.context_error() {
            Some(err) => Err(err.into()),
            None => Ok(MemberResult::errored(rank, MemberState::Errored, e.to_string())),
        },
    }
}

fn collect(results: Vec<EngineResult<MemberResult>>) -> EngineResult<RanksResp> {
    Ok(RanksResp {
        results: results.into_iter().collect::<EngineResult<_>>()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ScmStorage;
    use crate::testing::FakeRunner;

    async fn control_with(dir: &std::path::Path, log_mask: &str) -> RankControl {
        let harness = Arc::new(EngineHarness::new());
        let instance = EngineInstance::new(
            0,
            ScmStorage::new(dir.join("scm0"), "strata"),
            FakeRunner::new(),
            dir.join("strata_server.sock"),
        )
        .with_log_mask(log_mask);
        harness.add_instance(instance).await.unwrap();
        RankControl::new(harness, Duration::from_millis(5))
    }

    #[tokio::test]
    async fn reset_masks_with_empty_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let control = control_with(dir.path(), "").await;
        let req = LogMasksReq {
            reset_masks: true,
            ..Default::default()
        };
        let err = control
            .set_engine_log_masks(&Context::background(), &req)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "empty log masks in config");
    }

    #[tokio::test]
    async fn log_masks_on_stopped_engine_report_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let control = control_with(dir.path(), "ERR").await;
        let req = LogMasksReq {
            reset_masks: true,
            ..Default::default()
        };
        let resp = control
            .set_engine_log_masks(&Context::background(), &req)
            .await
            .unwrap();
        assert_eq!(resp.results.len(), 1);
        assert!(resp.results[0].errored);
        assert_eq!(resp.results[0].state, MemberState::Stopped);
    }

    #[tokio::test]
    async fn ping_stopped_engine_reports_local_state() {
        let dir = tempfile::tempdir().unwrap();
        let control = control_with(dir.path(), "ERR").await;
        let resp = control
            .handle(&Context::background(), RankMethod::PingRanks, &RanksReq::default())
            .await
            .unwrap();
        assert_eq!(resp.results, vec![MemberResult::new(Rank::NIL, MemberState::Stopped)]);
    }

    #[tokio::test]
    async fn stop_of_stopped_engine_is_immediate() {
        let dir = tempfile::tempdir().unwrap();
        let control = control_with(dir.path(), "ERR").await;
        let resp = control
            .stop_ranks(&Context::background(), &RanksReq::default())
            .await
            .unwrap();
        assert_eq!(resp.results[0].state, MemberState::Stopped);
    }

    #[test]
    fn drpc_context_failure_aborts() {
        let outcome: EngineResult<()> =
            Err(EngineError::Context(strata_core::ContextError::Canceled));
        assert!(matches!(
            drpc_result(Rank::new(1), MemberState::Joined, outcome),
            Err(EngineError::Context(_))
        ));

        let outcome: EngineResult<()> = Err(EngineError::NoReadyInstance);
        let result = drpc_result(Rank::new(1), MemberState::Joined, outcome).unwrap();
        assert!(result.errored);
        assert_eq!(result.state, MemberState::Errored);
    }
}
