//! PushPlanner: partitions eligible updates into one push per repository.
//!
//! Within a push each package contributes exactly one build. When two
//! updates carry builds of the same package, the build from the update
//! approved last wins (ties go to the greater update id) and the losers are
//! dropped with a `planning_conflict` caveat.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use masher_state::{Caveat, CaveatKind, PushId, RepoKey, RequestType, Update};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::collab::UpdateStore;
use crate::error::Result;

/// Namespace for deterministic push ids.
const PUSH_NAMESPACE: Uuid = Uuid::from_u128(0x6d61_7368_6572_4000_8000_7075_7368_6964);

/// One planned push: the repository, its members and planning caveats.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPush {
    pub repo: RepoKey,
    /// Ordered by update id.
    pub updates: Vec<Update>,
    pub caveats: Vec<Caveat>,
}

impl PlannedPush {
    /// Deterministic id for the `generation`-th push of this membership.
    ///
    /// Re-planning the same approved set yields the same id for generation 0;
    /// later generations are used once an earlier push with the same
    /// membership has already terminated.
    pub fn push_id(&self, generation: u32) -> PushId {
        let mut key = self.repo.to_string();
        for update in &self.updates {
            key.push('|');
            key.push_str(&update.id);
            for nvr in update.nvrs() {
                key.push(':');
                key.push_str(&nvr.to_string());
            }
        }
        key.push_str(&format!("#{generation}"));
        PushId(Uuid::new_v5(&PUSH_NAMESPACE, key.as_bytes()).to_string())
    }

    pub fn build_count(&self) -> usize {
        self.updates.iter().map(|u| u.builds.len()).sum()
    }
}

pub struct PushPlanner {
    updates: Arc<dyn UpdateStore>,
}

impl PushPlanner {
    pub fn new(updates: Arc<dyn UpdateStore>) -> Self {
        Self { updates }
    }

    /// Plan pushes for `request`, limited to `releases` when non-empty.
    #[instrument(skip(self))]
    pub async fn plan(&self, request: RequestType, releases: &[String]) -> Result<Vec<PlannedPush>> {
        let eligible = self.updates.eligible_updates(request).await?;
        let plans = plan_updates(request, eligible, releases);
        info!(pushes = plans.len(), "planned pushes");
        Ok(plans)
    }
}

/// Pure planning step over an explicit update set.
pub fn plan_updates(
    request: RequestType,
    updates: Vec<Update>,
    releases: &[String],
) -> Vec<PlannedPush> {
    let wanted: BTreeSet<String> = releases
        .iter()
        .map(|r| r.trim().to_ascii_uppercase())
        .collect();

    let mut by_repo: BTreeMap<RepoKey, Vec<Update>> = BTreeMap::new();
    for update in updates {
        if update.request != Some(request) {
            continue;
        }
        let repo = update.repo_key(request);
        if !wanted.is_empty() && !wanted.contains(&repo.release) {
            continue;
        }
        by_repo.entry(repo).or_default().push(update);
    }

    by_repo
        .into_iter()
        .filter_map(|(repo, members)| plan_repo(repo, members))
        .collect()
}

/// Rank of a build claim: later approval wins, then the greater update id.
type Claim = (DateTime<Utc>, String);

fn plan_repo(repo: RepoKey, mut members: Vec<Update>) -> Option<PlannedPush> {
    members.sort_by(|a, b| a.id.cmp(&b.id));
    let mut caveats = Vec::new();

    // package -> (claim, update id, nvr)
    let mut winners: BTreeMap<String, (Claim, String)> = BTreeMap::new();
    for update in &members {
        let claim: Claim = (update.approved_at, update.id.clone());
        for build in &update.builds {
            let package = build.package().to_string();
            match winners.get(&package) {
                Some((best, _)) if *best >= claim => {}
                _ => {
                    winners.insert(package, (claim.clone(), build.nvr.to_string()));
                }
            }
        }
    }

    let mut planned = Vec::with_capacity(members.len());
    for mut update in members {
        let before = update.builds.len();
        let update_id = update.id.clone();
        update.builds.retain(|build| {
            let Some(((_, winner_update), winner_nvr)) = winners.get(build.package()) else {
                return false;
            };
            let keep = *winner_update == update_id && *winner_nvr == build.nvr.to_string();
            if !keep {
                let message = format!(
                    "dropped {} from {}: {} from {} supersedes it",
                    build.nvr, update_id, winner_nvr, winner_update
                );
                warn!(repo = %repo, "{message}");
                caveats.push(Caveat::new(CaveatKind::PlanningConflict, message));
            }
            keep
        });

        if update.builds.is_empty() {
            let message = if before == 0 {
                format!("dropped {update_id}: it has no builds")
            } else {
                format!("dropped {update_id}: all of its builds were superseded")
            };
            warn!(repo = %repo, "{message}");
            caveats.push(Caveat::new(CaveatKind::PlanningConflict, message));
            continue;
        }
        planned.push(update);
    }

    if planned.is_empty() {
        return None;
    }
    Some(PlannedPush {
        repo,
        updates: planned,
        caveats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use masher_state::{Build, Nvr, UpdateStatus, UpdateType};

    fn update(id: &str, release: &str, nvrs: &[&str], approved_secs: i64) -> Update {
        Update {
            id: id.to_string(),
            title: id.to_string(),
            update_type: UpdateType::Bugfix,
            description: String::new(),
            release: release.to_string(),
            builds: nvrs
                .iter()
                .map(|n| Build::new(Nvr::parse(n).unwrap(), release))
                .collect(),
            bugs: Vec::new(),
            status: UpdateStatus::Testing,
            request: Some(RequestType::Stable),
            submitter: "alice".to_string(),
            approved_at: Utc.timestamp_opt(approved_secs, 0).unwrap(),
            staged_in: None,
            comments: Vec::new(),
        }
    }

    #[test]
    fn test_partitions_by_release() {
        let plans = plan_updates(
            RequestType::Stable,
            vec![
                update("U2", "F18", &["a-1.0-1.fc18"], 1),
                update("U1", "F17", &["a-1.0-1.fc17"], 1),
            ],
            &[],
        );
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].repo.to_string(), "f17-updates");
        assert_eq!(plans[1].repo.to_string(), "f18-updates");
    }

    #[test]
    fn test_release_filter() {
        let plans = plan_updates(
            RequestType::Stable,
            vec![
                update("U1", "F17", &["a-1.0-1.fc17"], 1),
                update("U2", "F18", &["a-1.0-1.fc18"], 1),
            ],
            &["f18".to_string()],
        );
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].repo.release, "F18");
    }

    #[test]
    fn test_last_validated_build_wins() {
        let plans = plan_updates(
            RequestType::Stable,
            vec![
                update("U1", "F17", &["a-1.0-1.fc17", "b-1.0-1.fc17"], 10),
                update("U2", "F17", &["a-1.1-1.fc17"], 20),
            ],
            &[],
        );
        let plan = &plans[0];
        assert_eq!(plan.build_count(), 2);
        let u1 = plan.updates.iter().find(|u| u.id == "U1").unwrap();
        assert_eq!(u1.builds.len(), 1);
        assert_eq!(u1.builds[0].nvr.name, "b");
        assert_eq!(plan.caveats.len(), 1);
        assert_eq!(plan.caveats[0].kind, CaveatKind::PlanningConflict);
        assert!(plan.caveats[0].message.contains("a-1.0-1.fc17"));
    }

    #[test]
    fn test_fully_superseded_update_is_dropped() {
        let plans = plan_updates(
            RequestType::Stable,
            vec![
                update("U1", "F17", &["a-1.0-1.fc17"], 10),
                update("U2", "F17", &["a-1.1-1.fc17"], 10),
            ],
            &[],
        );
        let plan = &plans[0];
        // Tie on approval time: greater id wins.
        assert_eq!(plan.updates.len(), 1);
        assert_eq!(plan.updates[0].id, "U2");
        assert_eq!(plan.caveats.len(), 2);
    }

    #[test]
    fn test_push_id_is_deterministic() {
        let a = plan_updates(
            RequestType::Stable,
            vec![
                update("U2", "F17", &["b-1.0-1.fc17"], 1),
                update("U1", "F17", &["a-1.0-1.fc17"], 1),
            ],
            &[],
        );
        let b = plan_updates(
            RequestType::Stable,
            vec![
                update("U1", "F17", &["a-1.0-1.fc17"], 1),
                update("U2", "F17", &["b-1.0-1.fc17"], 1),
            ],
            &[],
        );
        assert_eq!(a, b);
        assert_eq!(a[0].push_id(0), b[0].push_id(0));
        assert_ne!(a[0].push_id(0), a[0].push_id(1));
    }

    #[test]
    fn test_other_requests_ignored() {
        let mut testing = update("U1", "F17", &["a-1.0-1.fc17"], 1);
        testing.request = Some(RequestType::Testing);
        assert!(plan_updates(RequestType::Stable, vec![testing], &[]).is_empty());
    }
}
