//! Membership — the system-wide rank registry.
//!
//! Wraps the persistent `StateStore` with the operations the fan-out
//! coordinator and the system API need: resolving request targets,
//! reconciling per-rank results, joins and administrative exclusion.
//! Mutations are serialized so a read-modify-write of several members is
//! never interleaved with another one.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use strata_core::{
    Context, GroupMap, GroupMapEntry, HostSet, MemberResult, MemberState, Rank, RankSet,
};
use strata_state::{Member, StateStore};

use crate::error::{ClusterError, ClusterResult};
use crate::events::ClusterEvent;

/// Request from a starting engine to become (or stay) a system member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub uuid: Uuid,
    /// Rank already recorded in the engine's superblock, if any.
    #[serde(default)]
    pub rank: Option<Rank>,
    /// Control address of the engine's host.
    pub addr: String,
    #[serde(default)]
    pub fault_domain: String,
    #[serde(default)]
    pub uri: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinResponse {
    pub rank: Rank,
    pub map_version: u64,
    /// Number of times this rank has joined, including this one.
    pub incarnation: u64,
}

/// Request targets after checking them against the membership.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolved {
    pub hit: RankSet,
    pub absent_ranks: RankSet,
    pub absent_hosts: HostSet,
}

pub struct Membership {
    store: StateStore,
    update: Mutex<()>,
}

impl Membership {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            update: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Resolve a host list or a rank list into member ranks. Entries that
    /// are not in the membership are returned as absent. With neither
    /// list every member is selected.
    pub async fn resolve_ranks(&self, hosts: &HostSet, ranks: &RankSet) -> ClusterResult<Resolved> {
        if !hosts.is_empty() && !ranks.is_empty() {
            return Err(ClusterError::HostsAndRanks);
        }
        let members = self.store.list_members()?;

        let mut resolved = Resolved::default();
        if !hosts.is_empty() {
            let known: HostSet = members.iter().map(|m| m.addr.clone()).collect();
            resolved.absent_hosts = hosts.difference(&known);
            resolved.hit = members
                .iter()
                .filter(|m| hosts.contains(&m.addr))
                .map(|m| m.rank)
                .collect();
        } else {
            let all: RankSet = members.iter().map(|m| m.rank).collect();
            if ranks.is_empty() {
                resolved.hit = all;
            } else {
                resolved.absent_ranks = ranks.difference(&all);
                resolved.hit = ranks.difference(&resolved.absent_ranks);
            }
        }
        debug!(
            hit = %resolved.hit,
            absent_ranks = %resolved.absent_ranks,
            absent_hosts = %resolved.absent_hosts,
            "request targets resolved"
        );
        Ok(resolved)
    }

    /// Group member ranks by the address of their host.
    pub async fn rank_hosts(&self, ranks: &RankSet) -> ClusterResult<BTreeMap<String, RankSet>> {
        let mut by_host: BTreeMap<String, RankSet> = BTreeMap::new();
        for member in self.store.list_members()? {
            if ranks.contains(member.rank) {
                by_host.entry(member.addr).or_default().insert(member.rank);
            }
        }
        Ok(by_host)
    }

    /// Distinct host addresses owning any of `ranks`; an empty set means
    /// every member's host.
    pub async fn host_list(&self, ranks: &RankSet) -> ClusterResult<Vec<String>> {
        let hosts: BTreeSet<String> = self
            .store
            .list_members()?
            .into_iter()
            .filter(|m| ranks.is_empty() || ranks.contains(m.rank))
            .map(|m| m.addr)
            .collect();
        Ok(hosts.into_iter().collect())
    }

    /// Apply the states reported by one operation in a single batch.
    ///
    /// Errored results are skipped unless `update_on_fail` is set.
    /// Administratively excluded members keep their state.
    pub async fn update_member_states(
        &self,
        results: &[MemberResult],
        update_on_fail: bool,
    ) -> ClusterResult<()> {
        let _guard = self.update.lock().await;

        let mut changed: BTreeMap<Rank, Member> = BTreeMap::new();
        for result in results {
            if result.errored && !update_on_fail {
                continue;
            }
            let member = match changed.remove(&result.rank) {
                Some(member) => Some(member),
                None => self.store.get_member(result.rank)?,
            };
            let Some(mut member) = member else {
                warn!(rank = %result.rank, "result for unknown member ignored");
                continue;
            };
            if member.state == MemberState::AdminExcluded {
                continue;
            }
            member.state = result.state;
            member.info = result.msg.clone();
            changed.insert(member.rank, member);
        }

        if changed.is_empty() {
            return Ok(());
        }
        let members: Vec<Member> = changed.into_values().collect();
        let version = self.store.put_members(&members)?;
        debug!(count = members.len(), version, "member states updated");
        Ok(())
    }

    /// Register an engine, or refresh a re-joining one.
    pub async fn join(&self, req: &JoinRequest) -> ClusterResult<JoinResponse> {
        let _guard = self.update.lock().await;

        if let Some(mut member) = self.store.find_member_by_uuid(&req.uuid)? {
            if let Some(requested) = req.rank {
                if requested != member.rank {
                    return Err(ClusterError::RankMismatch {
                        uuid: req.uuid,
                        existing: member.rank,
                        requested,
                    });
                }
            }
            member.addr = req.addr.clone();
            member.uri = req.uri.clone();
            member.fault_domain = req.fault_domain.clone();
            member.state = MemberState::Joined;
            member.info.clear();
            member.incarnation += 1;
            let map_version = self.store.put_member(&member)?;
            info!(
                rank = %member.rank,
                uuid = %req.uuid,
                incarnation = member.incarnation,
                "member rejoined"
            );
            return Ok(JoinResponse {
                rank: member.rank,
                map_version,
                incarnation: member.incarnation,
            });
        }

        let rank = match req.rank {
            Some(rank) => {
                if let Some(existing) = self.store.get_member(rank)? {
                    return Err(ClusterError::RankInUse {
                        rank,
                        existing: existing.uuid,
                    });
                }
                rank
            }
            None => self.next_free_rank()?,
        };

        let mut member = Member::new(rank, req.uuid, req.addr.clone(), MemberState::Joined);
        member.uri = req.uri.clone();
        member.fault_domain = req.fault_domain.clone();
        member.incarnation = 1;
        let map_version = self.store.put_member(&member)?;
        info!(%rank, uuid = %req.uuid, addr = %req.addr, "member joined");
        Ok(JoinResponse {
            rank,
            map_version,
            incarnation: member.incarnation,
        })
    }

    fn next_free_rank(&self) -> ClusterResult<Rank> {
        let used: RankSet = self.store.list_members()?.iter().map(|m| m.rank).collect();
        (0..u32::MAX)
            .map(Rank::new)
            .find(|r| !used.contains(*r))
            .ok_or(ClusterError::NoFreeRank)
    }

    /// Mark members administratively excluded. Returns the data version.
    pub async fn exclude(&self, ranks: &RankSet) -> ClusterResult<u64> {
        self.set_admin_state(ranks, |_| true, MemberState::AdminExcluded).await
    }

    /// Return administratively excluded members to `Stopped`.
    pub async fn clear_excluded(&self, ranks: &RankSet) -> ClusterResult<u64> {
        self.set_admin_state(ranks, |m| m.state == MemberState::AdminExcluded, MemberState::Stopped)
            .await
    }

    async fn set_admin_state(
        &self,
        ranks: &RankSet,
        applies: impl Fn(&Member) -> bool,
        state: MemberState,
    ) -> ClusterResult<u64> {
        let _guard = self.update.lock().await;

        let mut members = Vec::with_capacity(ranks.len());
        for rank in ranks.iter() {
            let member = self
                .store
                .get_member(rank)?
                .ok_or(ClusterError::UnknownRank(rank))?;
            if applies(&member) {
                members.push(member);
            }
        }
        for member in &mut members {
            member.state = state;
            member.info.clear();
        }
        let version = self.store.put_members(&members)?;
        info!(%ranks, %state, version, "membership updated by administrator");
        Ok(version)
    }

    /// Members in any of `states`; an empty filter lists all.
    pub async fn members(&self, states: &[MemberState]) -> ClusterResult<Vec<Member>> {
        Ok(self
            .store
            .list_members()?
            .into_iter()
            .filter(|m| states.is_empty() || states.contains(&m.state))
            .collect())
    }

    /// Rank-to-URI map of the members currently in the group.
    pub async fn group_map(&self) -> ClusterResult<GroupMap> {
        let version = self.store.data_version()?;
        let members = self
            .store
            .list_members()?
            .into_iter()
            .filter(|m| matches!(m.state, MemberState::Joined | MemberState::Ready))
            .map(|m| GroupMapEntry {
                rank: m.rank,
                uri: m.uri,
                incarnation: m.incarnation,
            })
            .collect();
        Ok(GroupMap { version, members })
    }

    /// Record an engine exit. Returns whether the member changed.
    ///
    /// Exits of ranks that are already down or being stopped, or that come
    /// from an earlier incarnation, are ignored.
    pub async fn rank_down(&self, rank: Rank, incarnation: u64, exit: &str) -> ClusterResult<bool> {
        let _guard = self.update.lock().await;

        let Some(mut member) = self.store.get_member(rank)? else {
            warn!(%rank, "exit reported for unknown member");
            return Ok(false);
        };
        if member.state.is_down() || member.state == MemberState::Stopping {
            debug!(%rank, state = %member.state, "exit of stopped member ignored");
            return Ok(false);
        }
        if incarnation < member.incarnation {
            debug!(%rank, incarnation, current = member.incarnation, "stale exit ignored");
            return Ok(false);
        }
        member.state = MemberState::Errored;
        member.info = exit.to_string();
        self.store.put_member(&member)?;
        warn!(%rank, incarnation, exit, "member marked errored after exit");
        Ok(true)
    }

    /// Apply cluster events until `ctx` is done.
    pub async fn run_events(&self, ctx: &Context, mut events: broadcast::Receiver<ClusterEvent>) {
        loop {
            let event = match ctx.run(events.recv()).await {
                Err(reason) => {
                    debug!(%reason, "membership event loop stopping");
                    return;
                }
                Ok(Ok(event)) => event,
                Ok(Err(broadcast::error::RecvError::Lagged(n))) => {
                    warn!(skipped = n, "membership event loop lagged");
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return,
            };
            match event {
                ClusterEvent::RankDown {
                    rank,
                    incarnation,
                    exit,
                } => {
                    if let Err(e) = self.rank_down(rank, incarnation, &exit).await {
                        warn!(%rank, error = %e, "failed to record member exit");
                    }
                }
                ClusterEvent::StopFailed { ranks, msg } => {
                    warn!(%ranks, %msg, "system stop failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn membership() -> Membership {
        Membership::new(StateStore::open_in_memory().unwrap())
    }

    fn join_req(addr: &str, rank: Option<u32>) -> JoinRequest {
        JoinRequest {
            uuid: Uuid::new_v4(),
            rank: rank.map(Rank::new),
            addr: addr.to_string(),
            fault_domain: "/rack0".to_string(),
            uri: format!("tcp://{addr}"),
        }
    }

    async fn seeded() -> Membership {
        let m = membership();
        for (addr, rank) in [("a:10001", 0), ("a:10001", 1), ("b:10001", 2), ("b:10001", 3)] {
            m.join(&join_req(addr, Some(rank))).await.unwrap();
        }
        m
    }

    #[tokio::test]
    async fn join_allocates_lowest_free_rank() {
        let m = membership();
        m.join(&join_req("a:10001", Some(1))).await.unwrap();
        let resp = m.join(&join_req("a:10001", None)).await.unwrap();
        assert_eq!(resp.rank, Rank::new(0));
        let resp = m.join(&join_req("a:10001", None)).await.unwrap();
        assert_eq!(resp.rank, Rank::new(2));
        assert_eq!(resp.map_version, m.store().data_version().unwrap());
    }

    #[tokio::test]
    async fn members_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("members.redb");
        let joined = {
            let m = Membership::new(StateStore::open(&path).unwrap());
            m.join(&join_req("a:10001", None)).await.unwrap()
        };

        let m = Membership::new(StateStore::open(&path).unwrap());
        let members = m.members(&[]).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].rank, joined.rank);
        assert_eq!(m.store().data_version().unwrap(), joined.map_version);
    }

    #[tokio::test]
    async fn rejoin_is_idempotent_and_bumps_incarnation() {
        let m = membership();
        let req = join_req("a:10001", None);
        let first = m.join(&req).await.unwrap();

        let mut again = req.clone();
        again.rank = Some(first.rank);
        let second = m.join(&again).await.unwrap();
        assert_eq!(second.rank, first.rank);
        assert!(second.map_version > first.map_version);

        assert_eq!(first.incarnation, 1);
        assert_eq!(second.incarnation, 2);
    }

    #[tokio::test]
    async fn join_conflicts_are_rejected() {
        let m = membership();
        let req = join_req("a:10001", Some(4));
        m.join(&req).await.unwrap();

        let err = m.join(&join_req("b:10001", Some(4))).await.unwrap_err();
        assert!(matches!(err, ClusterError::RankInUse { .. }));

        let mut moved = req.clone();
        moved.rank = Some(Rank::new(5));
        let err = m.join(&moved).await.unwrap_err();
        assert!(matches!(err, ClusterError::RankMismatch { .. }));
    }

    #[tokio::test]
    async fn resolve_records_absent_ranks_and_hosts() {
        let m = seeded().await;

        let r = m
            .resolve_ranks(&HostSet::new(), &"2-5".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(r.hit.to_string(), "2-3");
        assert_eq!(r.absent_ranks.to_string(), "4-5");

        let hosts: HostSet = "b:10001,c:10001".parse().unwrap();
        let r = m.resolve_ranks(&hosts, &RankSet::new()).await.unwrap();
        assert_eq!(r.hit.to_string(), "2-3");
        assert_eq!(r.absent_hosts.to_string(), "c:10001");

        let r = m.resolve_ranks(&HostSet::new(), &RankSet::new()).await.unwrap();
        assert_eq!(r.hit.to_string(), "0-3");

        let err = m
            .resolve_ranks(&hosts, &"0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::HostsAndRanks));
    }

    #[tokio::test]
    async fn ranks_grouped_by_host() {
        let m = seeded().await;
        let by_host = m.rank_hosts(&"1-2".parse().unwrap()).await.unwrap();
        assert_eq!(by_host.len(), 2);
        assert_eq!(by_host["a:10001"].to_string(), "1");
        assert_eq!(by_host["b:10001"].to_string(), "2");
        assert_eq!(
            m.host_list(&RankSet::new()).await.unwrap(),
            vec!["a:10001".to_string(), "b:10001".to_string()]
        );
    }

    #[tokio::test]
    async fn update_on_fail_controls_errored_results() {
        let m = seeded().await;
        let results = vec![
            MemberResult::new(Rank::new(0), MemberState::Stopped),
            MemberResult::errored(Rank::new(1), MemberState::Errored, "kill failed"),
        ];

        let before = m.store().data_version().unwrap();
        m.update_member_states(&results, false).await.unwrap();
        assert_eq!(m.store().data_version().unwrap(), before + 1);
        assert_eq!(
            m.store().get_member(Rank::new(0)).unwrap().unwrap().state,
            MemberState::Stopped
        );
        assert_eq!(m.store().get_member(Rank::new(1)).unwrap().unwrap().state, MemberState::Joined);

        m.update_member_states(&results, true).await.unwrap();
        let member = m.store().get_member(Rank::new(1)).unwrap().unwrap();
        assert_eq!(member.state, MemberState::Errored);
        assert_eq!(member.info, "kill failed");
    }

    #[tokio::test]
    async fn excluded_members_ignore_results_until_cleared() {
        let m = seeded().await;
        let ranks: RankSet = "2".parse().unwrap();
        m.exclude(&ranks).await.unwrap();

        m.update_member_states(&[MemberResult::new(Rank::new(2), MemberState::Joined)], false)
            .await
            .unwrap();
        let excluded = m.members(&[MemberState::AdminExcluded]).await.unwrap();
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].rank, Rank::new(2));

        m.clear_excluded(&ranks).await.unwrap();
        assert_eq!(
            m.store().get_member(Rank::new(2)).unwrap().unwrap().state,
            MemberState::Stopped
        );

        let err = m.exclude(&"9".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, ClusterError::UnknownRank(r) if r == Rank::new(9)));
    }

    #[tokio::test]
    async fn rank_down_marks_running_member_errored() {
        let m = seeded().await;
        assert!(m.rank_down(Rank::new(0), 1, "signal 9").await.unwrap());
        let member = m.store().get_member(Rank::new(0)).unwrap().unwrap();
        assert_eq!(member.state, MemberState::Errored);
        assert_eq!(member.info, "signal 9");

        // Already down.
        assert!(!m.rank_down(Rank::new(0), 1, "again").await.unwrap());

        m.update_member_states(&[MemberResult::new(Rank::new(1), MemberState::Stopping)], false)
            .await
            .unwrap();
        assert!(!m.rank_down(Rank::new(1), 1, "signal 2").await.unwrap());

        // Older incarnation.
        assert!(!m.rank_down(Rank::new(2), 0, "stale").await.unwrap());
        assert!(!m.rank_down(Rank::new(7), 1, "unknown").await.unwrap());
    }

    #[tokio::test]
    async fn group_map_lists_joined_members() {
        let m = seeded().await;
        m.exclude(&"3".parse().unwrap()).await.unwrap();
        let map = m.group_map().await.unwrap();
        assert_eq!(map.version, m.store().data_version().unwrap());
        let ranks: Vec<u32> = map.members.iter().map(|e| e.rank.get()).collect();
        assert_eq!(ranks, vec![0, 1, 2]);
        assert_eq!(map.members[0].uri, "tcp://a:10001");
    }

    #[tokio::test]
    async fn event_loop_applies_rank_down() {
        let m = std::sync::Arc::new(seeded().await);
        let bus = crate::events::EventBus::new();
        let ctx = Context::background().with_cancel();
        let task = {
            let m = std::sync::Arc::clone(&m);
            let ctx = ctx.clone();
            let rx = bus.subscribe();
            tokio::spawn(async move { m.run_events(&ctx, rx).await })
        };

        bus.publish(ClusterEvent::RankDown {
            rank: Rank::new(3),
            incarnation: 1,
            exit: "exit status 1".into(),
        });
        let membership = &m;
        strata_engine::poll::poll_until(&ctx, std::time::Duration::from_millis(5), || async move {
            let member = membership.store().get_member(Rank::new(3)).unwrap().unwrap();
            member.state == MemberState::Errored
        })
        .await
        .unwrap();

        ctx.cancel();
        task.await.unwrap();
    }
}
