//! Fitness arena: scoring, promotion, and demotion policy.
//!
//! A candidate promotes to dominant once it has enough history and beats
//! the incumbent by a margin. Three consecutive failures deprecate an
//! allele and the selector skips it.

use crate::fitness;
use crate::registry::{Allele, AlleleState};

/// Invocations required before an allele may be promoted.
pub const PROMOTION_MIN_INVOCATIONS: u64 = 50;

/// Fitness margin a challenger must hold over the dominant.
pub const PROMOTION_MARGIN: f64 = 0.05;

/// Consecutive failures that deprecate an allele.
pub const DEMOTION_THRESHOLD: u32 = 3;

/// Current fitness of an allele, in [0.0, 1.0].
pub fn compute_fitness(allele: &Allele) -> f64 {
    fitness::compute_temporal_fitness(allele)
}

pub fn record_success(allele: &mut Allele) {
    allele.successful_invocations += 1;
    allele.consecutive_failures = 0;
}

pub fn record_failure(allele: &mut Allele) {
    allele.failed_invocations += 1;
    allele.consecutive_failures += 1;
}

/// Promotion gate: enough invocations, and either no incumbent or a
/// fitness lead of at least the margin.
pub fn should_promote(candidate: &Allele, dominant: Option<&Allele>) -> bool {
    if candidate.total_invocations() < PROMOTION_MIN_INVOCATIONS {
        return false;
    }
    match dominant {
        None => true,
        Some(current) => {
            if current.sha256 == candidate.sha256 {
                return false;
            }
            compute_fitness(candidate) > compute_fitness(current) + PROMOTION_MARGIN
        }
    }
}

pub fn should_demote(allele: &Allele) -> bool {
    allele.consecutive_failures >= DEMOTION_THRESHOLD
}

pub fn set_dominant(allele: &mut Allele) {
    allele.state = AlleleState::Dominant;
}

pub fn set_recessive(allele: &mut Allele) {
    allele.state = AlleleState::Recessive;
}

pub fn set_deprecated(allele: &mut Allele) {
    allele.state = AlleleState::Deprecated;
}
