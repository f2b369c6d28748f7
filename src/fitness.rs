//! Temporal fitness: three-timescale scoring with retroactive decay.
//!
//! Immediate (30%): did the gene succeed right now?
//! Convergence (50%): does the system settle into a stable state after?
//! Resilience (20%): does the change hold up over time?
//!
//! Diagnostic genes feed observations back to configuration alleles via
//! the `feeds` declarations in their contracts.

use crate::contract::Timescale;
use crate::registry::{unix_now, Allele, FitnessRecord, PeerObservation};

pub const IMMEDIATE_WEIGHT: f64 = 0.30;
pub const CONVERGENCE_WEIGHT: f64 = 0.50;
pub const RESILIENCE_WEIGHT: f64 = 0.20;

/// Each convergence failure shaves this fraction off the immediate score.
pub const CONVERGENCE_DECAY_FACTOR: f64 = 0.2;

/// Sliding window of fitness records kept per allele.
pub const MAX_FITNESS_RECORDS: usize = 200;

/// Peer invocations required before peer results influence fitness.
pub const MIN_PEER_INVOCATIONS: u64 = 10;

const LOCAL_WEIGHT: f64 = 0.7;
const PEER_WEIGHT: f64 = 0.3;

fn score_for_timescale(records: &[FitnessRecord], timescale: Timescale) -> Option<f64> {
    let relevant: Vec<&FitnessRecord> =
        records.iter().filter(|r| r.timescale == timescale).collect();
    if relevant.is_empty() {
        return None;
    }
    let successes = relevant.iter().filter(|r| r.success).count();
    Some(successes as f64 / relevant.len() as f64)
}

/// Weighted temporal fitness across three timescales, in [0.0, 1.0].
///
/// Falls back to the plain success ratio when no diagnostic feedback has
/// been recorded, so fresh alleles keep the simpler behavior.
pub fn compute_temporal_fitness(allele: &Allele) -> f64 {
    let total = allele.total_invocations();
    if total == 0 {
        return 0.0;
    }
    // A new allele must accumulate 10 invocations before immediate can
    // reach 1.0.
    let mut immediate = allele.successful_invocations as f64 / (total.max(10)) as f64;

    let convergence = score_for_timescale(&allele.fitness_records, Timescale::Convergence);
    let resilience = score_for_timescale(&allele.fitness_records, Timescale::Resilience);

    if convergence.is_none() && resilience.is_none() {
        return allele.successful_invocations as f64 / total as f64;
    }

    let convergence_failures = allele
        .fitness_records
        .iter()
        .filter(|r| r.timescale == Timescale::Convergence && !r.success)
        .count();
    if convergence_failures > 0 {
        let decay = (1.0 - CONVERGENCE_DECAY_FACTOR * convergence_failures as f64).max(0.0);
        immediate *= decay;
    }

    let conv_score = convergence.unwrap_or(1.0);
    let res_score = resilience.unwrap_or(1.0);

    immediate * IMMEDIATE_WEIGHT + conv_score * CONVERGENCE_WEIGHT + res_score * RESILIENCE_WEIGHT
}

/// Append a diagnostic observation to a config allele, keeping only the
/// most recent `MAX_FITNESS_RECORDS`.
pub fn record_feedback(allele: &mut Allele, timescale: Timescale, success: bool, source_locus: &str) {
    allele.fitness_records.push(FitnessRecord {
        timescale,
        success,
        source_locus: source_locus.to_string(),
        timestamp: unix_now(),
    });
    if allele.fitness_records.len() > MAX_FITNESS_RECORDS {
        let excess = allele.fitness_records.len() - MAX_FITNESS_RECORDS;
        allele.fitness_records.drain(..excess);
    }
}

/// Latest aggregate results for an allele from a named peer. Replaces any
/// previous observation from the same peer.
pub fn record_peer_observation(allele: &mut Allele, peer: &str, successes: u64, failures: u64) {
    let observation = PeerObservation {
        peer: peer.to_string(),
        successes,
        failures,
        timestamp: unix_now(),
    };
    match allele.peer_observations.iter_mut().find(|o| o.peer == peer) {
        Some(existing) => *existing = observation,
        None => allele.peer_observations.push(observation),
    }
}

/// Blend local and peer-reported fitness once enough peer data exists:
/// 0.7 × local + 0.3 × peer success ratio. Below the threshold this is
/// just the local temporal fitness.
pub fn compute_distributed_fitness(allele: &Allele) -> f64 {
    let local = compute_temporal_fitness(allele);
    let peer_successes: u64 = allele.peer_observations.iter().map(|o| o.successes).sum();
    let peer_failures: u64 = allele.peer_observations.iter().map(|o| o.failures).sum();
    let peer_total = peer_successes + peer_failures;
    if peer_total < MIN_PEER_INVOCATIONS {
        return local;
    }
    LOCAL_WEIGHT * local + PEER_WEIGHT * (peer_successes as f64 / peer_total as f64)
}
