// Deterministic pseudo-random validator selection.
//
// Candidates are ordered by address ascending before sampling; the index
// stream is keccak over (transaction hash, round, counter) reduced modulo
// the pool size, with rejection sampling for duplicates. Selection is
// independent of stake unless the weighted mode is requested.

use indexmap::IndexMap;

use synod_common::{
    consensus::{ConsensusData, ConsensusHistory},
    crypto::{keccak256, Address, Hash},
    validator::Validator,
};

use crate::core::error::ConsensusError;

fn seed_material(tx_hash: &Hash, round: u64) -> Vec<u8> {
    let mut seed = Vec::with_capacity(40);
    seed.extend_from_slice(tx_hash.as_bytes());
    seed.extend_from_slice(&round.to_le_bytes());
    seed
}

fn index_at(seed: &[u8], counter: u64, modulus: usize) -> usize {
    let mut data = seed.to_vec();
    data.extend_from_slice(&counter.to_le_bytes());
    let digest = keccak256(&data);
    // digest is 32 bytes, the first 8 are always present
    let raw = u64::from_le_bytes(digest[0..8].try_into().unwrap_or_default());
    (raw % modulus as u64) as usize
}

// Select `count` distinct validators from the pool
pub fn select_validators(
    candidates: &[Validator],
    count: usize,
    tx_hash: &Hash,
    round: u64,
) -> Result<Vec<Validator>, ConsensusError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if candidates.len() < count {
        return Err(ConsensusError::NotEnoughValidators {
            required: count,
            available: candidates.len(),
        });
    }

    let mut pool = candidates.to_vec();
    pool.sort_by(|a, b| a.address.as_bytes().cmp(b.address.as_bytes()));

    let seed = seed_material(tx_hash, round);
    let mut selected: Vec<Validator> = Vec::with_capacity(count);
    let mut counter = 0u64;
    while selected.len() < count {
        let index = index_at(&seed, counter, pool.len());
        let candidate = &pool[index];
        if !selected.iter().any(|v| v.address == candidate.address) {
            selected.push(candidate.clone());
        }
        counter = counter.wrapping_add(1);
    }
    Ok(selected)
}

// Stake-weighted variant: the index stream picks positions in the
// cumulative stake line instead of the candidate list
pub fn select_validators_weighted(
    candidates: &[Validator],
    count: usize,
    tx_hash: &Hash,
    round: u64,
) -> Result<Vec<Validator>, ConsensusError> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if candidates.len() < count {
        return Err(ConsensusError::NotEnoughValidators {
            required: count,
            available: candidates.len(),
        });
    }

    let mut pool = candidates.to_vec();
    pool.sort_by(|a, b| a.address.as_bytes().cmp(b.address.as_bytes()));

    let total_stake: u64 = pool.iter().map(|v| v.stake.max(1)).sum();
    let seed = seed_material(tx_hash, round);
    let mut selected: Vec<Validator> = Vec::with_capacity(count);
    let mut counter = 0u64;
    while selected.len() < count {
        let mut point = index_at(&seed, counter, total_stake as usize) as u64;
        counter = counter.wrapping_add(1);
        let mut picked = None;
        for candidate in &pool {
            let weight = candidate.stake.max(1);
            if point < weight {
                picked = Some(candidate.clone());
                break;
            }
            point -= weight;
        }
        let Some(candidate) = picked else { continue };
        if !selected.iter().any(|v| v.address == candidate.address) {
            selected.push(candidate);
        }
    }
    Ok(selected)
}

// Split the registered pool into the validators already involved in the
// consensus round (receipt holders) and the untouched remainder
pub fn validators_from_consensus_data(
    all_validators: &[Validator],
    consensus_data: &ConsensusData,
    include_leader: bool,
) -> (Vec<Validator>, IndexMap<Address, Validator>) {
    let mut remaining: IndexMap<Address, Validator> = all_validators
        .iter()
        .map(|validator| (validator.address, validator.clone()))
        .collect();

    let mut receipt_addresses = Vec::new();
    if include_leader {
        if let Some(leader) = consensus_data.leader_receipt() {
            receipt_addresses.push(leader.node_config.address);
        }
    }
    receipt_addresses.extend(
        consensus_data
            .validators
            .iter()
            .map(|receipt| receipt.node_config.address),
    );

    let mut involved = Vec::with_capacity(receipt_addresses.len());
    for address in receipt_addresses {
        if let Some(validator) = remaining.shift_remove(&address) {
            involved.push(validator);
        }
    }
    (involved, remaining)
}

#[derive(Debug)]
pub struct AppealValidators {
    // receipt holders of the consensus data, leader excluded
    pub current: Vec<Validator>,
    // the set that runs the appeal round: a reused suffix of `current`
    // plus freshly selected members
    pub extra: Vec<Validator>,
}

// Appeal augmentation. With n the initial committee size (the leader is
// selected on top of it), the appeal round runs with:
//
//   appeal_failed | reused from previous round | freshly selected
//   --------------+---------------------------+-----------------
//        0        |             0             |      n + 2
//        1        |           n + 2           |      n + 1
//        2        |          2n + 3           |       2n
//
// The (reused, new) split is derived from the size of the previous
// round's final set so these counts hold for any n.
pub fn get_extra_validators(
    all_validators: &[Validator],
    consensus_history: &ConsensusHistory,
    consensus_data: &ConsensusData,
    appeal_failed: u32,
    tx_hash: &Hash,
) -> Result<AppealValidators, ConsensusError> {
    let (current, mut remaining) =
        validators_from_consensus_data(all_validators, consensus_data, false);

    for address in consensus_history.used_leader_addresses() {
        remaining.shift_remove(&address);
    }
    if let Some(leader) = consensus_data.leader_receipt() {
        remaining.shift_remove(&leader.node_config.address);
    }

    let pool: Vec<Validator> = remaining.into_values().collect();
    if pool.is_empty() {
        return Err(ConsensusError::NotEnoughValidators {
            required: 1,
            available: 0,
        });
    }

    // seed round varies per appeal attempt so reruns do not reuse indices
    let selection_round = consensus_history.rounds.len() as u64 + appeal_failed as u64;
    let current_size = current.len();

    let extra = match appeal_failed {
        0 => select_validators(&pool, current_size + 2, tx_hash, selection_round)?,
        1 => {
            let n = current_size.saturating_sub(2) / 2;
            let fresh = select_validators(&pool, n + 1, tx_hash, selection_round)?;
            let mut extra: Vec<Validator> = current[n.min(current_size)..].to_vec();
            extra.extend(fresh);
            extra
        }
        f => {
            let n = current_size.saturating_sub(3) / (2 * f as usize - 1);
            let fresh = select_validators(&pool, 2 * n, tx_hash, selection_round)?;
            let mut extra: Vec<Validator> = current[n.min(current_size)..].to_vec();
            extra.extend(fresh);
            extra
        }
    };

    Ok(AppealValidators { current, extra })
}
