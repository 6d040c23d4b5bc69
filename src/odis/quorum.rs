//! Threshold decisions over signer outcomes.
//!
//! The combiner classifies every signer reply into a [`SignerOutcome`] and
//! asks [`ThresholdPolicy::decide`] after each one whether a verdict is
//! already certain. All quorum rules live here.

use std::collections::BTreeMap;

use crate::domain::DomainState;
use crate::error::{OdisError, OdisResult};

/// Status recorded for signers that did not answer in time.
const TIMEOUT_STATUS: u16 = 408;

/// One signer's contribution to a fan-out round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerOutcome<T> {
    /// Structurally consistent, verified result.
    Success(T),
    RateLimited { not_before: Option<u64> },
    Disabled,
    /// Any other error response, or a reply that failed verification.
    Rejected { status: u16 },
    Unreachable { timed_out: bool },
}

impl<T> SignerOutcome<T> {
    fn status(&self) -> Option<u16> {
        match self {
            Self::Success(_) => None,
            Self::RateLimited { .. } => Some(429),
            Self::Disabled => Some(403),
            Self::Rejected { status } => Some(*status),
            Self::Unreachable { timed_out: true } => Some(TIMEOUT_STATUS),
            Self::Unreachable { timed_out: false } => Some(502),
        }
    }
}

/// Verdict of a fan-out round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumDecision {
    /// At least `t` successes.
    Reached,
    /// Not enough outcomes yet to decide.
    Pending,
    /// Disabled signers alone make a quorum impossible.
    Disabled,
    /// Rate limits and disabled signers make a quorum impossible.
    RateLimited { not_before: Option<u64> },
    /// Quorum impossible for any other reason.
    Unavailable {
        successes: usize,
        majority_status: Option<u16>,
    },
}

/// Explicit `t`-of-`n` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPolicy {
    threshold: usize,
    total: usize,
}

impl ThresholdPolicy {
    pub fn new(threshold: usize, total: usize) -> OdisResult<Self> {
        if threshold == 0 || threshold > total {
            return Err(OdisError::InvalidThreshold { threshold, total });
        }
        Ok(Self { threshold, total })
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Decide from the outcomes gathered so far.
    ///
    /// Missing outcomes count as possible successes, so a `Pending` verdict
    /// turns into a final one as soon as the remaining signers can no
    /// longer change it.
    pub fn decide<'a, T: 'a>(
        &self,
        outcomes: impl IntoIterator<Item = &'a SignerOutcome<T>>,
    ) -> QuorumDecision {
        let mut seen = 0usize;
        let mut successes = 0usize;
        let mut disabled = 0usize;
        let mut rate_limited = Vec::new();
        let mut statuses: BTreeMap<u16, usize> = BTreeMap::new();

        for outcome in outcomes {
            seen += 1;
            match outcome {
                SignerOutcome::Success(_) => successes += 1,
                SignerOutcome::Disabled => disabled += 1,
                SignerOutcome::RateLimited { not_before } => rate_limited.push(*not_before),
                _ => {}
            }
            if let Some(status) = outcome.status() {
                *statuses.entry(status).or_default() += 1;
            }
        }

        if successes >= self.threshold {
            return QuorumDecision::Reached;
        }

        let pending = self.total.saturating_sub(seen);
        if successes + pending >= self.threshold {
            return QuorumDecision::Pending;
        }

        if self.total.saturating_sub(disabled) < self.threshold {
            return QuorumDecision::Disabled;
        }

        if self.total.saturating_sub(disabled + rate_limited.len()) < self.threshold {
            return QuorumDecision::RateLimited {
                not_before: self.soonest_retry(successes, disabled, rate_limited),
            };
        }

        QuorumDecision::Unavailable {
            successes,
            majority_status: majority_status(&statuses),
        }
    }

    /// Earliest time enough rate-limited signers would accept again.
    ///
    /// `None` when too many signers are disabled or out of quota for good.
    /// If fewer signers reported a retry time than are still needed, the
    /// latest reported time is a lower bound.
    fn soonest_retry(
        &self,
        successes: usize,
        disabled: usize,
        not_before: Vec<Option<u64>>,
    ) -> Option<u64> {
        let exhausted = not_before.iter().filter(|t| t.is_none()).count();
        if self.total.saturating_sub(disabled + exhausted) < self.threshold {
            return None;
        }

        let mut finite: Vec<u64> = not_before.into_iter().flatten().collect();
        finite.sort_unstable();
        let needed = self.threshold.saturating_sub(successes).max(1);
        finite.get(needed - 1).or(finite.last()).copied()
    }
}

/// Most frequent error status, ignoring timeouts. Ties go to the lower code.
fn majority_status(statuses: &BTreeMap<u16, usize>) -> Option<u16> {
    statuses
        .iter()
        .filter(|(status, _)| **status != TIMEOUT_STATUS)
        .fold(None, |best: Option<(u16, usize)>, (&status, &count)| match best {
            Some((_, best_count)) if best_count >= count => best,
            _ => Some((status, count)),
        })
        .map(|(status, _)| status)
}

/// Domain state a threshold of signers agrees is at least this restrictive.
///
/// Disabled if too many signers report the domain disabled. Otherwise the
/// `t`-th smallest counter among enabled signers, and among those at or
/// below it, the `t`-th smallest timer.
pub fn threshold_domain_state(
    states: &[DomainState],
    threshold: usize,
    total: usize,
) -> OdisResult<DomainState> {
    let disabled = states.iter().filter(|s| s.disabled).count();
    if total.saturating_sub(disabled) < threshold {
        return Ok(DomainState {
            counter: 0,
            timer: 0,
            disabled: true,
        });
    }

    let mut enabled: Vec<&DomainState> = states.iter().filter(|s| !s.disabled).collect();
    if threshold == 0 || enabled.len() < threshold {
        return Err(OdisError::InsufficientSigners {
            needed: threshold,
            have: enabled.len(),
        });
    }

    enabled.sort_unstable_by_key(|s| s.counter);
    let counter = enabled[threshold - 1].counter;

    let mut timers: Vec<u64> = enabled
        .iter()
        .filter(|s| s.counter <= counter)
        .map(|s| s.timer)
        .collect();
    timers.sort_unstable();
    let timer = timers
        .get(threshold - 1)
        .copied()
        .ok_or(OdisError::InsufficientSigners {
            needed: threshold,
            have: timers.len(),
        })?;

    Ok(DomainState {
        counter,
        timer,
        disabled: false,
    })
}
