//! Shard assignment.
//!
//! A pure function from the alive event processors to a partition of the
//! shard space. Every agent evaluates it on its own snapshot of the agent
//! store, so identical input must always produce identical output.
//!
//! Two strategies are available:
//!
//! - **Rendezvous** (default): each shard ranks all agents by a hash of
//!   `(agent id, shard)` and goes to the best-ranked agent that still has
//!   capacity. Capacity is `⌊N/k⌋` or `⌈N/k⌉`. A join or leave moves only
//!   the shards whose preferred owner changed plus the few needed to keep
//!   the load bounded.
//! - **Contiguous**: agents sorted by id receive consecutive ranges.
//!   Simple, but one join can shift every range boundary.

use std::collections::{BTreeMap, BTreeSet};

use outbox_types::{fnv1a_64, AgentId, AssignmentStrategy};

/// Mapping from agent to owned shards, covering `0..total`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShardAssignment {
    total: u32,
    owners: BTreeMap<AgentId, BTreeSet<u32>>,
}

impl ShardAssignment {
    /// Assignment in which no shard has an owner.
    pub fn empty(total: u32) -> Self {
        Self {
            total,
            owners: BTreeMap::new(),
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Shards owned by `agent`; empty if it takes no part.
    pub fn shards_for(&self, agent: &AgentId) -> BTreeSet<u32> {
        self.owners.get(agent).cloned().unwrap_or_default()
    }

    pub fn owner_of(&self, shard: u32) -> Option<AgentId> {
        self.owners
            .iter()
            .find(|(_, shards)| shards.contains(&shard))
            .map(|(id, _)| *id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentId> {
        self.owners.keys()
    }

    pub fn agent_count(&self) -> usize {
        self.owners.len()
    }

    /// Whether the owned sets are disjoint and cover `0..total` exactly.
    pub fn is_partition(&self) -> bool {
        let mut seen = BTreeSet::new();
        for shards in self.owners.values() {
            for shard in shards {
                if *shard >= self.total || !seen.insert(*shard) {
                    return false;
                }
            }
        }
        seen.len() == self.total as usize
    }

    /// Number of shards whose owner differs between the two assignments.
    pub fn moved_shards(&self, other: &ShardAssignment) -> usize {
        (0..self.total.max(other.total))
            .filter(|shard| self.owner_of(*shard) != other.owner_of(*shard))
            .count()
    }
}

/// Compute the assignment of `total` shards over `agents`.
///
/// Input order and duplicates do not matter. With no agents, no shard is
/// owned.
pub fn compute_assignment(
    strategy: AssignmentStrategy,
    agents: &[AgentId],
    total: u32,
) -> ShardAssignment {
    let mut sorted: Vec<AgentId> = agents.to_vec();
    sorted.sort();
    sorted.dedup();

    if sorted.is_empty() || total == 0 {
        return ShardAssignment::empty(total);
    }

    let owners = match strategy {
        AssignmentStrategy::Rendezvous => rendezvous(&sorted, total),
        AssignmentStrategy::Contiguous => contiguous(&sorted, total),
    };
    ShardAssignment { total, owners }
}

fn contiguous(agents: &[AgentId], total: u32) -> BTreeMap<AgentId, BTreeSet<u32>> {
    let k = agents.len() as u32;
    let base = total / k;
    let extra = total % k;

    agents
        .iter()
        .enumerate()
        .map(|(i, id)| {
            let i = i as u32;
            let start = i * base + i.min(extra);
            let len = base + u32::from(i < extra);
            (*id, (start..start + len).collect())
        })
        .collect()
}

fn rendezvous(agents: &[AgentId], total: u32) -> BTreeMap<AgentId, BTreeSet<u32>> {
    let k = agents.len() as u32;
    let base = (total / k) as usize;
    let mut extra_left = (total % k) as usize;

    let keys: Vec<(AgentId, Vec<u8>)> = agents
        .iter()
        .map(|id| (*id, id.to_string().into_bytes()))
        .collect();
    let mut owners: BTreeMap<AgentId, BTreeSet<u32>> =
        agents.iter().map(|id| (*id, BTreeSet::new())).collect();

    for shard in 0..total {
        let mut ranked: Vec<(u64, AgentId)> = keys
            .iter()
            .map(|(id, key)| (score(key, shard), *id))
            .collect();
        // Highest score first; id breaks ties.
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        for (_, id) in ranked {
            let Some(owned) = owners.get_mut(&id) else {
                continue;
            };
            if owned.len() < base {
                owned.insert(shard);
                break;
            }
            if owned.len() == base && extra_left > 0 {
                extra_left -= 1;
                owned.insert(shard);
                break;
            }
        }
    }

    owners.retain(|_, shards| !shards.is_empty());
    owners
}

fn score(agent_key: &[u8], shard: u32) -> u64 {
    let mut bytes = Vec::with_capacity(agent_key.len() + 4);
    bytes.extend_from_slice(agent_key);
    bytes.extend_from_slice(&shard.to_le_bytes());
    mix64(fnv1a_64(&bytes))
}

/// SplitMix64 finalizer; spreads FNV output over all bits.
fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
