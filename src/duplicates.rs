//! Duplicate detection over catalog entities.
//!
//! Batches are grouped by transitive closure: if A~B and B~C clear the threshold, A, B and C
//! share a group even when A~C does not.

use crate::config::DuplicateConfig;
use crate::error::{CoreError, CoreResult};
use crate::patterns;
use crate::similarity::SimilarityEngine;
use crate::store::EntityStore;
use crate::types::{
    DuplicateGroup, EntityId, EntityRecord, GroupId, Resolution, SimilarCandidate,
};
use chrono::Utc;
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Disjoint sets over batch positions
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self { parent: (0..n).collect() }
    }

    fn find(&mut self, x: usize) -> usize {
        let mut root = x;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = x;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            // Smaller position becomes root so grouping is deterministic
            let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
            self.parent[hi] = lo;
        }
    }
}

pub struct DuplicateDetector {
    config: DuplicateConfig,
    similarity: Arc<SimilarityEngine>,
    store: Arc<dyn EntityStore>,
    groups: RwLock<BTreeMap<GroupId, DuplicateGroup>>,
    next_group: AtomicU64,
}

impl DuplicateDetector {
    pub fn new(
        config: DuplicateConfig,
        similarity: Arc<SimilarityEngine>,
        store: Arc<dyn EntityStore>,
    ) -> Self {
        Self {
            config,
            similarity,
            store,
            groups: RwLock::new(BTreeMap::new()),
            next_group: AtomicU64::new(1),
        }
    }

    async fn load(&self, id: EntityId) -> CoreResult<EntityRecord> {
        self.store
            .get_entity(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("entity {}", id)))
    }

    /// Candidates sharing the entity's name prefix, scored and ranked, best first
    pub async fn find_similar(&self, entity_id: EntityId) -> CoreResult<Vec<SimilarCandidate>> {
        let entity = self.load(entity_id).await?;
        let key = patterns::blocking_key(&entity.name, self.config.blocking_prefix_len);
        if key.is_empty() {
            return Ok(Vec::new());
        }

        let neighbours = self
            .store
            .entities_by_name_prefix(&key, self.config.prefix_scan_limit)
            .await?;

        let mut ranked: Vec<SimilarCandidate> = neighbours
            .into_iter()
            .filter(|other| other.id != entity.id)
            .map(|other| SimilarCandidate {
                score: self.similarity.compare(&entity, &other),
                entity_id: other.id,
                name: other.name,
            })
            .filter(|c| c.score >= self.config.threshold)
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        ranked.truncate(self.config.max_candidates);

        debug!(
            "Entity {} has {} similar candidates under key '{}'",
            entity_id,
            ranked.len(),
            key
        );
        Ok(ranked)
    }

    /// Group a pre-blocked batch. Every pair is compared.
    pub async fn detect_batch(&self, entity_ids: &[EntityId]) -> CoreResult<Vec<DuplicateGroup>> {
        let ids: Vec<EntityId> = entity_ids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let entities = try_join_all(ids.iter().map(|id| self.load(*id))).await?;
        let n = entities.len();

        let mut scores = vec![vec![0.0; n]; n];
        let mut sets = UnionFind::new(n);
        for i in 0..n {
            scores[i][i] = 1.0;
            for j in (i + 1)..n {
                let s = self.similarity.compare(&entities[i], &entities[j]);
                scores[i][j] = s;
                scores[j][i] = s;
                if s >= self.config.threshold {
                    sets.union(i, j);
                }
            }
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..n {
            components.entry(sets.find(i)).or_default().push(i);
        }

        let now = Utc::now();
        let mut created = Vec::new();
        for members in components.into_values().filter(|m| m.len() >= 2) {
            let representative = pick_representative(&members, &entities, &scores);
            let mut similarity_scores = Vec::new();
            for (x, &i) in members.iter().enumerate() {
                for &j in &members[x + 1..] {
                    similarity_scores.push((entities[i].id, entities[j].id, scores[i][j]));
                }
            }
            created.push(DuplicateGroup {
                group_id: self.next_group.fetch_add(1, Ordering::SeqCst),
                member_entity_ids: members.iter().map(|&i| entities[i].id).collect(),
                representative_id: entities[representative].id,
                similarity_scores,
                resolution: Resolution::Unresolved,
                created_at: now,
                resolved_at: None,
            });
        }

        {
            let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
            for group in &created {
                groups.insert(group.group_id, group.clone());
            }
        }

        info!(
            "Duplicate detection over {} entities produced {} groups",
            n,
            created.len()
        );
        Ok(created)
    }

    pub fn resolve(
        &self,
        group_id: GroupId,
        resolution: Resolution,
        representative_id: Option<EntityId>,
    ) -> CoreResult<DuplicateGroup> {
        let mut groups = self.groups.write().unwrap_or_else(PoisonError::into_inner);
        let group = groups
            .get_mut(&group_id)
            .ok_or_else(|| CoreError::NotFound(format!("duplicate group {}", group_id)))?;

        if group.resolution != Resolution::Unresolved {
            return Err(CoreError::InvalidState(format!(
                "duplicate group {} is already resolved",
                group_id
            )));
        }

        match resolution {
            Resolution::Unresolved => {
                return Err(CoreError::InvalidInput(
                    "resolution must be merged or kept_separate".into(),
                ))
            }
            Resolution::Merged => {
                if let Some(rep) = representative_id {
                    if !group.member_entity_ids.contains(&rep) {
                        return Err(CoreError::InvalidInput(format!(
                            "entity {} is not a member of group {}",
                            rep, group_id
                        )));
                    }
                    group.representative_id = rep;
                }
            }
            Resolution::KeptSeparate => {}
        }

        group.resolution = resolution;
        group.resolved_at = Some(Utc::now());
        info!("Duplicate group {} resolved as {:?}", group_id, resolution);
        Ok(group.clone())
    }

    pub fn group(&self, group_id: GroupId) -> CoreResult<DuplicateGroup> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&group_id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("duplicate group {}", group_id)))
    }

    pub fn groups(&self) -> Vec<DuplicateGroup> {
        self.groups
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// Most populated record wins; then highest mean similarity to the group; then lowest id
fn pick_representative(members: &[usize], entities: &[EntityRecord], scores: &[Vec<f64>]) -> usize {
    let mean_similarity = |i: usize| {
        let others = members.iter().filter(|&&j| j != i);
        others.clone().map(|&j| scores[i][j]).sum::<f64>() / others.count().max(1) as f64
    };
    let mut best = members[0];
    for &candidate in &members[1..] {
        let by_fields = entities[candidate]
            .populated_fields()
            .cmp(&entities[best].populated_fields());
        let better = match by_fields {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => {
                match mean_similarity(candidate).total_cmp(&mean_similarity(best)) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => entities[candidate].id < entities[best].id,
                }
            }
        };
        if better {
            best = candidate;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimilarityConfig;
    use crate::similarity::{Comparator, Field, FieldSpec};
    use crate::store::InMemoryEntityStore;

    fn detector(entities: Vec<EntityRecord>, threshold: f64) -> DuplicateDetector {
        let similarity = Arc::new(SimilarityEngine::with_fields(
            SimilarityConfig::default(),
            vec![FieldSpec { field: Field::Measures, comparator: Comparator::Numeric { scale: 10.0 } }],
        ));
        let config = DuplicateConfig { threshold, ..DuplicateConfig::default() };
        DuplicateDetector::new(config, similarity, Arc::new(InMemoryEntityStore::with_entities(entities)))
    }

    fn at(id: EntityId, name: &str, x: f64) -> EntityRecord {
        EntityRecord::new(id, name).with_measure("x", x)
    }

    #[tokio::test]
    async fn test_chain_forms_one_group() {
        // 1~2 and 2~3 clear 0.75 (distance 2), 1~3 does not (distance 4)
        let d = detector(
            vec![at(1, "a", 0.0), at(2, "b", 2.0), at(3, "c", 4.0), at(4, "d", 50.0)],
            0.75,
        );
        let groups = d.detect_batch(&[3, 1, 2, 4]).await.unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_entity_ids, vec![1, 2, 3]);
        assert_eq!(groups[0].similarity_scores.len(), 3);
        // Same populated fields; the middle member is closest to the rest
        assert_eq!(groups[0].representative_id, 2);
    }

    #[tokio::test]
    async fn test_missing_entity_is_not_found() {
        let d = detector(vec![at(1, "a", 0.0)], 0.5);
        assert!(matches!(d.detect_batch(&[1, 9]).await, Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_resolve_rules() {
        let d = detector(vec![at(1, "a", 0.0), at(2, "b", 0.0), at(3, "c", 99.0)], 0.9);
        let group = d.detect_batch(&[1, 2, 3]).await.unwrap().remove(0);

        assert!(matches!(
            d.resolve(group.group_id, Resolution::Merged, Some(3)),
            Err(CoreError::InvalidInput(_))
        ));
        let merged = d.resolve(group.group_id, Resolution::Merged, Some(2)).unwrap();
        assert_eq!(merged.representative_id, 2);
        assert!(merged.resolved_at.is_some());
        assert!(matches!(
            d.resolve(group.group_id, Resolution::KeptSeparate, None),
            Err(CoreError::InvalidState(_))
        ));
        assert!(matches!(d.resolve(999, Resolution::Merged, None), Err(CoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_new_run_does_not_touch_resolved_groups() {
        let d = detector(vec![at(1, "a", 0.0), at(2, "b", 0.0)], 0.9);
        let first = d.detect_batch(&[1, 2]).await.unwrap().remove(0);
        d.resolve(first.group_id, Resolution::KeptSeparate, None).unwrap();

        let second = d.detect_batch(&[1, 2]).await.unwrap().remove(0);

        assert_ne!(first.group_id, second.group_id);
        assert_eq!(d.group(first.group_id).unwrap().resolution, Resolution::KeptSeparate);
        assert_eq!(d.groups().len(), 2);
    }

    #[tokio::test]
    async fn test_find_similar_ranks_within_prefix() {
        let similarity = Arc::new(SimilarityEngine::new(SimilarityConfig::default()));
        let store = Arc::new(InMemoryEntityStore::with_entities(vec![
            EntityRecord::new(1, "Болт М10х40"),
            EntityRecord::new(2, "болт м10х40"),
            EntityRecord::new(3, "Болт М10х45"),
            EntityRecord::new(4, "Гайка М10"),
        ]));
        let config = DuplicateConfig { threshold: 0.8, ..DuplicateConfig::default() };
        let d = DuplicateDetector::new(config, similarity, store);

        let found = d.find_similar(1).await.unwrap();
        let ids: Vec<_> = found.iter().map(|c| c.entity_id).collect();

        assert_eq!(ids, vec![2, 3]);
        assert!((found[0].score - 1.0).abs() < 1e-9);
    }
}
