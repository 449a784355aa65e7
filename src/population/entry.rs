//! Derive the improvement strategy for a selected parent from its fitness.

use rand::seq::SliceRandom;
use rand::Rng;

use super::task::SelfImproveEntry;
use crate::agent::Agent;

/// Accuracy step requested by a stochasticity entry.
pub const STOCHASTICITY_STEP: f64 = 0.1;

/// Pick the improvement a child of `parent` should attempt.
///
/// Checked in order: empty patches, context overflow, more unresolved than
/// resolved instances (targets a random unresolved id), otherwise
/// stochasticity with a target of `min(accuracy + 0.1, 1.0)`. A parent with
/// no fitness record, or one that is mostly unresolved but lists no ids,
/// gets [`SelfImproveEntry::GeneralImprovement`].
pub fn generate_self_improve_entry<R: Rng + ?Sized>(
    parent: &Agent,
    rng: &mut R,
) -> SelfImproveEntry {
    let Some(fitness) = parent.fitness.as_ref() else {
        return SelfImproveEntry::GeneralImprovement;
    };

    if fitness.empty_patch_count > 0 {
        return SelfImproveEntry::SolveEmptyPatches;
    }
    if fitness.context_length_exceeded {
        return SelfImproveEntry::SolveContextLength;
    }
    if fitness.unresolved_count > fitness.resolved_count {
        return match fitness.unresolved_ids.choose(rng) {
            Some(id) => SelfImproveEntry::SolveInstance {
                instance_id: id.clone(),
            },
            None => SelfImproveEntry::GeneralImprovement,
        };
    }
    SelfImproveEntry::SolveStochasticity {
        target_accuracy: (fitness.accuracy + STOCHASTICITY_STEP).min(1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Fitness;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn parent(f: Fitness) -> Agent {
        Agent::seed("p").with_fitness(f)
    }

    #[test]
    fn test_empty_patches_take_precedence() {
        let mut f = Fitness::from_counts(1, 9);
        f.empty_patch_count = 2;
        f.context_length_exceeded = true;
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            generate_self_improve_entry(&parent(f), &mut rng),
            SelfImproveEntry::SolveEmptyPatches
        );
    }

    #[test]
    fn test_context_length_before_instances() {
        let mut f = Fitness::from_counts(1, 9);
        f.context_length_exceeded = true;
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(
            generate_self_improve_entry(&parent(f), &mut rng),
            SelfImproveEntry::SolveContextLength
        );
    }

    #[test]
    fn test_mostly_unresolved_targets_listed_instance() {
        let mut f = Fitness::from_counts(2, 5);
        f.unresolved_ids = vec!["a".into(), "b".into(), "c".into()];
        let mut rng = StdRng::seed_from_u64(9);
        match generate_self_improve_entry(&parent(f), &mut rng) {
            SelfImproveEntry::SolveInstance { instance_id } => {
                assert!(["a", "b", "c"].contains(&instance_id.as_str()));
            }
            other => panic!("unexpected entry {other:?}"),
        }
    }

    #[test]
    fn test_mostly_unresolved_without_ids_is_general() {
        let f = Fitness::from_counts(2, 5);
        let mut rng = StdRng::seed_from_u64(9);
        assert_eq!(
            generate_self_improve_entry(&parent(f), &mut rng),
            SelfImproveEntry::GeneralImprovement
        );
    }

    #[test]
    fn test_stochasticity_target_is_capped() {
        let mut rng = StdRng::seed_from_u64(3);
        match generate_self_improve_entry(&parent(Fitness::from_counts(13, 7)), &mut rng) {
            SelfImproveEntry::SolveStochasticity { target_accuracy } => {
                assert!((target_accuracy - 0.75).abs() < 1e-9);
            }
            other => panic!("unexpected entry {other:?}"),
        }
        let e = generate_self_improve_entry(&parent(Fitness::with_accuracy(0.95)), &mut rng);
        assert_eq!(
            e,
            SelfImproveEntry::SolveStochasticity {
                target_accuracy: 1.0
            }
        );
    }

    #[test]
    fn test_unevaluated_parent_is_general() {
        let mut rng = StdRng::seed_from_u64(3);
        assert_eq!(
            generate_self_improve_entry(&Agent::seed("x"), &mut rng),
            SelfImproveEntry::GeneralImprovement
        );
    }
}
