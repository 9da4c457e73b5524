//! Parallel group computation.
//!
//! Walks the plan in order and batches consecutive steps that can run
//! concurrently. A step is forced into a new group when it repeats a worker
//! type already used in the open group, or when one of its input artifacts
//! is produced inside the open group (artifact dependencies are the
//! authoritative signal; type repetition is a secondary throttle).

use std::collections::HashSet;

use weft_core::plan::Step;
use weft_core::types::WorkerType;

/// Partition steps into parallel groups of indices into `steps`.
pub fn group_steps(steps: &[Step]) -> Vec<Vec<usize>> {
    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut current: Vec<usize> = Vec::new();
    let mut used_types: HashSet<WorkerType> = HashSet::new();
    let mut group_outputs: HashSet<&str> = HashSet::new();

    for (i, step) in steps.iter().enumerate() {
        let depends_on_group = step
            .input_artifacts
            .iter()
            .any(|a| group_outputs.contains(a.as_str()));
        let type_repeats = used_types.contains(&step.worker_type);

        if (depends_on_group || type_repeats) && !current.is_empty() {
            groups.push(std::mem::take(&mut current));
            used_types.clear();
            group_outputs.clear();
        }

        current.push(i);
        used_types.insert(step.worker_type);
        if let Some(out) = &step.output_artifact {
            group_outputs.insert(out.as_str());
        }
    }

    if !current.is_empty() {
        groups.push(current);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(id: &str, worker_type: WorkerType) -> Step {
        Step::new(id, id, worker_type, "task")
    }

    #[test]
    fn test_disjoint_types_share_a_group() {
        let steps = vec![
            step("a", WorkerType::Researcher),
            step("b", WorkerType::Writer),
            step("c", WorkerType::Analyst),
        ];
        assert_eq!(group_steps(&steps), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_repeated_type_starts_new_group() {
        // [A(t1), B(t2), C(t1)] with no cross-dependencies -> [[A,B],[C]]
        let steps = vec![
            step("a", WorkerType::Researcher),
            step("b", WorkerType::Writer),
            step("c", WorkerType::Researcher),
        ];
        assert_eq!(group_steps(&steps), vec![vec![0, 1], vec![2]]);
    }

    #[test]
    fn test_artifact_dependency_splits_group() {
        // B consumes A's output: distinct worker types alone would have
        // grouped them, but the dependency forces a split
        let steps = vec![
            step("a", WorkerType::Researcher).with_output("notes.md"),
            step("b", WorkerType::Writer).with_inputs(vec!["notes.md".into()]),
        ];
        assert_eq!(group_steps(&steps), vec![vec![0], vec![1]]);
    }

    #[test]
    fn test_dependency_on_earlier_group_does_not_split() {
        // C depends on A, but A's group is already closed by B's type repeat
        let steps = vec![
            step("a", WorkerType::Researcher).with_output("notes.md"),
            step("b", WorkerType::Researcher),
            step("c", WorkerType::Writer).with_inputs(vec!["notes.md".into()]),
        ];
        assert_eq!(group_steps(&steps), vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn test_empty_plan() {
        assert!(group_steps(&[]).is_empty());
    }

    #[test]
    fn test_linear_template_degenerates_to_singletons() {
        // A fully chained plan (each step consumes its predecessor's output)
        // yields one group per step
        let steps = vec![
            step("a", WorkerType::Researcher).with_output("one.md"),
            step("b", WorkerType::Analyst).with_inputs(vec!["one.md".into()]).with_output("two.md"),
            step("c", WorkerType::Writer).with_inputs(vec!["two.md".into()]),
        ];
        assert_eq!(group_steps(&steps), vec![vec![0], vec![1], vec![2]]);
    }
}
