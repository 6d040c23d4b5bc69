//! Sequential-delay rate limiting.
//!
//! Each accepted attempt advances a counter. The counter selects a stage,
//! and the stage decides how long after the timer the attempt may land.
//! Only the first attempt of each batch pays the stage delay; the rest of
//! the batch is free. Once the counter runs past the last stage the domain
//! is out of quota for good.

use super::{DomainState, SequentialDelayDomain, SequentialDelayStage};

/// Outcome of evaluating one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequentialDelayResult {
    pub accepted: bool,
    /// Earliest acceptable attempt time. `None` when waiting will never help.
    pub not_before: Option<u64>,
    /// State after the attempt; unchanged on rejection.
    pub state: DomainState,
}

impl SequentialDelayResult {
    fn rejected(state: DomainState, not_before: Option<u64>) -> Self {
        Self {
            accepted: false,
            not_before,
            state,
        }
    }
}

struct IndexedStage<'a> {
    stage: &'a SequentialDelayStage,
    /// First request index this stage governs.
    start: u64,
}

/// Evaluate an attempt made at `attempt_time` against `state`.
///
/// Pure: persistence of the returned state is the caller's job.
pub fn evaluate(
    domain: &SequentialDelayDomain,
    attempt_time: u64,
    state: Option<&DomainState>,
) -> SequentialDelayResult {
    let current = state.copied().unwrap_or_default();

    if current.disabled {
        return SequentialDelayResult::rejected(current, None);
    }

    let Some(indexed) = indexed_stage(domain, current.counter) else {
        return SequentialDelayResult::rejected(current, None);
    };

    let not_before = current
        .timer
        .saturating_add(delay_for(&indexed, current.counter));

    if attempt_time < not_before {
        return SequentialDelayResult::rejected(current, Some(not_before));
    }

    let timer = if indexed.stage.resets_timer() {
        attempt_time
    } else {
        not_before
    };

    SequentialDelayResult {
        accepted: true,
        not_before: Some(not_before),
        state: DomainState {
            counter: current.counter + 1,
            timer,
            disabled: false,
        },
    }
}

/// Locate the stage covering request index `counter`.
fn indexed_stage(domain: &SequentialDelayDomain, counter: u64) -> Option<IndexedStage<'_>> {
    let mut start = 0u64;
    for stage in &domain.stages {
        let end = start.saturating_add(
            stage
                .batch_len()
                .saturating_mul(stage.repetition_count()),
        );
        if counter < end {
            return Some(IndexedStage { stage, start });
        }
        start = end;
    }
    None
}

fn delay_for(indexed: &IndexedStage<'_>, counter: u64) -> u64 {
    let batch_len = indexed.stage.batch_len().max(1);
    if (counter - indexed.start) % batch_len == 0 {
        indexed.stage.delay
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(delay: u64) -> SequentialDelayStage {
        SequentialDelayStage::new(delay)
    }

    /// Accept attempts at the earliest allowed time until the policy runs out.
    fn drain(domain: &SequentialDelayDomain, start_time: u64) -> Vec<DomainState> {
        let mut state = DomainState::default();
        let mut now = start_time;
        let mut history = vec![];
        loop {
            let result = evaluate(domain, now, Some(&state));
            if !result.accepted {
                match result.not_before {
                    Some(t) => {
                        now = t;
                        continue;
                    }
                    None => return history,
                }
            }
            state = result.state;
            history.push(state);
        }
    }

    #[test]
    fn test_scenario_free_batch_then_delay() {
        let domain = SequentialDelayDomain::new(vec![stage(0).with_batch_size(5), stage(60)]);
        let mut state = DomainState::default();

        for i in 0..5 {
            let result = evaluate(&domain, 1_000 + i, Some(&state));
            assert!(result.accepted, "request {i} should be free");
            state = result.state;
        }
        assert_eq!(state.counter, 5);
        assert_eq!(state.timer, 1_004);

        let early = evaluate(&domain, 1_030, Some(&state));
        assert!(!early.accepted);
        assert_eq!(early.not_before, Some(1_064));
        assert_eq!(early.state, state);

        let on_time = evaluate(&domain, 1_064, Some(&state));
        assert!(on_time.accepted);
        assert_eq!(on_time.state.counter, 6);

        // Policy exhausted after the last stage
        let after = evaluate(&domain, 1_000_000, Some(&on_time.state));
        assert!(!after.accepted);
        assert_eq!(after.not_before, None);
    }

    #[test]
    fn test_empty_policy_always_rejects() {
        let domain = SequentialDelayDomain::new(vec![]);
        let result = evaluate(&domain, 1_000, None);
        assert!(!result.accepted);
        assert_eq!(result.not_before, None);
        assert_eq!(result.state, DomainState::default());
    }

    #[test]
    fn test_no_reset_timer_advances_by_owed_delay() {
        let domain = SequentialDelayDomain::new(vec![
            stage(100).with_reset_timer(false).with_repetitions(3),
        ]);
        let first = evaluate(&domain, 100, None);
        assert!(first.accepted);
        assert_eq!(first.state.timer, 100);

        // Ten seconds late: the timer lands on the schedule, not on the attempt
        let second = evaluate(&domain, 210, Some(&first.state));
        assert!(second.accepted);
        assert_eq!(second.state.timer, 200);

        let third = evaluate(&domain, 300, Some(&second.state));
        assert!(third.accepted);
        assert_eq!(third.state.timer, 300);
    }

    #[test]
    fn test_reset_timer_jumps_to_attempt_time() {
        let domain = SequentialDelayDomain::new(vec![stage(100).with_repetitions(2)]);
        let first = evaluate(&domain, 100, None);
        let second = evaluate(&domain, 250, Some(&first.state));
        assert!(second.accepted);
        assert_eq!(second.state.timer, 250);
    }

    #[test]
    fn test_disabled_state_rejects_without_retry_time() {
        let domain = SequentialDelayDomain::new(vec![stage(0)]);
        let state = DomainState {
            disabled: true,
            ..DomainState::default()
        };
        let result = evaluate(&domain, 1_000, Some(&state));
        assert!(!result.accepted);
        assert_eq!(result.not_before, None);
        assert_eq!(result.state, state);
    }

    #[test]
    fn test_first_attempt_with_delay_measures_from_zero() {
        let domain = SequentialDelayDomain::new(vec![stage(30)]);
        assert!(evaluate(&domain, 30, None).accepted);
        assert!(!evaluate(&domain, 29, None).accepted);
    }

    #[test]
    fn test_stage_boundary_resolves_to_new_stage() {
        let domain = SequentialDelayDomain::new(vec![
            stage(0).with_batch_size(2),
            stage(500),
        ]);
        let state = DomainState {
            counter: 2,
            timer: 1_000,
            disabled: false,
        };
        let result = evaluate(&domain, 1_000, Some(&state));
        assert!(!result.accepted);
        assert_eq!(result.not_before, Some(1_500));
    }

    #[test]
    fn test_counter_strictly_increases_and_timer_never_decreases() {
        let policies = [
            vec![stage(0).with_batch_size(5), stage(60)],
            vec![stage(10).with_reset_timer(false).with_repetitions(4)],
            vec![
                stage(1).with_batch_size(3).with_repetitions(2),
                stage(7).with_reset_timer(false).with_batch_size(2).with_repetitions(3),
                stage(0).with_repetitions(5),
            ],
        ];

        for stages in policies {
            let domain = SequentialDelayDomain::new(stages);
            for start in [0, 1, 1_700_000_000] {
                let history = drain(&domain, start);
                let mut previous = DomainState::default();
                for state in &history {
                    assert_eq!(state.counter, previous.counter + 1);
                    assert!(state.timer >= previous.timer);
                    previous = *state;
                }
            }
        }
    }

    #[test]
    fn test_every_counter_in_range_resolves_to_exactly_one_stage() {
        let domain = SequentialDelayDomain::new(vec![
            stage(1).with_batch_size(3).with_repetitions(2),
            stage(2).with_batch_size(1).with_repetitions(4),
            stage(3).with_batch_size(4),
        ]);
        let total = domain.total_attempts().unwrap();
        assert_eq!(total, 14);

        let mut expected_starts = vec![];
        let mut start = 0;
        for s in &domain.stages {
            let attempts = s.attempts().unwrap();
            expected_starts.extend(std::iter::repeat_n(start, attempts as usize));
            start += attempts;
        }

        for counter in 0..total {
            let indexed = indexed_stage(&domain, counter).expect("counter within policy");
            assert_eq!(indexed.start, expected_starts[counter as usize]);
        }
        for counter in total..total + 10 {
            assert!(indexed_stage(&domain, counter).is_none());
            let state = DomainState {
                counter,
                timer: 0,
                disabled: false,
            };
            assert!(!evaluate(&domain, u64::MAX, Some(&state)).accepted);
        }
        assert_eq!(drain(&domain, 0).len() as u64, total);
    }

    #[test]
    fn test_only_batch_starts_pay_the_delay() {
        for batch_size in 1..=6u64 {
            let domain = SequentialDelayDomain::new(vec![
                stage(0).with_batch_size(3),
                stage(50).with_batch_size(batch_size).with_repetitions(4),
            ]);
            let stage_start = 3;
            for counter in stage_start..stage_start + batch_size * 4 {
                let state = DomainState {
                    counter,
                    timer: 10_000,
                    disabled: false,
                };
                let result = evaluate(&domain, 0, Some(&state));
                let pays = (counter - stage_start) % batch_size == 0;
                assert_eq!(
                    result.not_before,
                    Some(if pays { 10_050 } else { 10_000 }),
                    "batch_size={batch_size} counter={counter}"
                );
            }
        }
    }

    #[test]
    fn test_timer_overflow_saturates() {
        let domain = SequentialDelayDomain::new(vec![stage(u64::MAX)]);
        let state = DomainState {
            counter: 0,
            timer: 10,
            disabled: false,
        };
        let result = evaluate(&domain, u64::MAX - 1, Some(&state));
        assert!(!result.accepted);
        assert_eq!(result.not_before, Some(u64::MAX));
    }
}
