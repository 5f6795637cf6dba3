//! Mapping raw preference records onto prompt/response examples
//!
//! The conditional mapping keeps each record's pair under its own prompt.
//! The joint mapping additionally builds cross-prompt pairs, so the
//! preferred and dispreferred sides may be conditioned on different prompts.

use super::{PreferenceRecord, PromptFormatter};
use itertools::Itertools;

/// A preference pair where each side carries its own prompt
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceExample {
    pub chosen_prompt: String,
    pub chosen: String,
    pub rejected_prompt: String,
    pub rejected: String,
}

impl PreferenceExample {
    pub fn new(chosen_prompt: &str, chosen: &str, rejected_prompt: &str, rejected: &str) -> Self {
        Self {
            chosen_prompt: chosen_prompt.to_string(),
            chosen: chosen.to_string(),
            rejected_prompt: rejected_prompt.to_string(),
            rejected: rejected.to_string(),
        }
    }

    /// Whether both sides share a prompt
    pub fn is_conditional(&self) -> bool {
        self.chosen_prompt == self.rejected_prompt
    }
}

impl PreferenceRecord {
    /// Prompt the rejected response answers
    fn rejected_side_prompt(&self) -> &str {
        match &self.rejected_prompt {
            Some(p) if !p.is_empty() => p,
            _ => &self.prompt,
        }
    }
}

/// Conditional mapping: one example per record with a shared prompt.
///
/// Natively joint records have no conditional reading and are dropped.
pub fn return_prompt_and_responses<P: PromptFormatter + ?Sized>(
    batch: &[PreferenceRecord],
    formatter: &P,
) -> Vec<PreferenceExample> {
    batch
        .iter()
        .filter(|r| !r.is_joint())
        .map(|r| {
            let prompt = formatter.format_prompt(&r.prompt);
            PreferenceExample::new(&prompt, &r.chosen, &prompt, &r.rejected)
        })
        .collect()
}

/// Joint mapping.
///
/// Every conditional record yields its own pair plus a cross pair that
/// prefers its chosen response over the rejected response of the next
/// record in the batch (wrapping around), answered under that record's
/// prompt. Cross pairs are only built when the two prompts differ.
/// Natively joint records pass through as a single example.
pub fn return_prompt_and_responses_augmented<P: PromptFormatter + ?Sized>(
    batch: &[PreferenceRecord],
    formatter: &P,
) -> Vec<PreferenceExample> {
    let n = batch.len();
    let mut examples = Vec::with_capacity(2 * n);
    for (ix, record) in batch.iter().enumerate() {
        let prompt = formatter.format_prompt(&record.prompt);
        if record.is_joint() {
            let rejected_prompt = formatter.format_prompt(record.rejected_side_prompt());
            examples.push(PreferenceExample::new(
                &prompt,
                &record.chosen,
                &rejected_prompt,
                &record.rejected,
            ));
            continue;
        }
        examples.push(PreferenceExample::new(
            &prompt,
            &record.chosen,
            &prompt,
            &record.rejected,
        ));

        if n < 2 {
            continue;
        }
        let other = &batch[(ix + 1) % n];
        if other.rejected_side_prompt() != record.prompt {
            let other_prompt = formatter.format_prompt(other.rejected_side_prompt());
            examples.push(PreferenceExample::new(
                &prompt,
                &record.chosen,
                &other_prompt,
                &other.rejected,
            ));
        }
    }
    examples
}

/// Runs the conditional or joint mapping over chunks of `map_batch_size`
/// records. Cross pairs never span two chunks.
pub fn map_batched<P: PromptFormatter + ?Sized>(
    records: &[PreferenceRecord],
    map_batch_size: usize,
    joint: bool,
    formatter: &P,
) -> Vec<PreferenceExample> {
    let examples = records
        .chunks(map_batch_size.max(1))
        .flat_map(|chunk| {
            if joint {
                return_prompt_and_responses_augmented(chunk, formatter)
            } else {
                return_prompt_and_responses(chunk, formatter)
            }
        })
        .collect_vec();

    if !joint {
        let dropped = records.iter().filter(|r| r.is_joint()).count();
        if dropped > 0 {
            tracing::warn!(
                dropped,
                "dropped natively joint records from a conditional run"
            );
        }
    }
    tracing::debug!(
        records = records.len(),
        examples = examples.len(),
        joint,
        "mapped preference records"
    );
    examples
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{AlpacaPromptFormatter, PlainPromptFormatter};
    use rstest::*;

    #[fixture]
    fn records() -> Vec<PreferenceRecord> {
        vec![
            PreferenceRecord::new("p0", "c0", "r0"),
            PreferenceRecord::new("p1", "c1", "r1"),
            PreferenceRecord::new("p2", "c2", "r2"),
        ]
    }

    #[rstest]
    fn test_conditional_mapping(records: Vec<PreferenceRecord>) {
        let examples = return_prompt_and_responses(&records, &PlainPromptFormatter);
        assert_eq!(examples.len(), 3);
        assert!(examples.iter().all(PreferenceExample::is_conditional));
        assert_eq!(examples[1], PreferenceExample::new("p1", "c1", "p1", "r1"));
    }

    #[rstest]
    fn test_conditional_mapping_drops_joint_records(mut records: Vec<PreferenceRecord>) {
        records.push(PreferenceRecord::new("p3", "c3", "r3").with_rejected_prompt("q3"));
        let examples = return_prompt_and_responses(&records, &PlainPromptFormatter);
        assert_eq!(examples.len(), 3);
    }

    #[rstest]
    fn test_augmented_mapping_adds_cross_pairs(records: Vec<PreferenceRecord>) {
        let examples = return_prompt_and_responses_augmented(&records, &PlainPromptFormatter);
        assert_eq!(examples.len(), 6);
        assert_eq!(examples[0], PreferenceExample::new("p0", "c0", "p0", "r0"));
        assert_eq!(examples[1], PreferenceExample::new("p0", "c0", "p1", "r1"));
        // the last record wraps around to the first
        assert_eq!(examples[5], PreferenceExample::new("p2", "c2", "p0", "r0"));
        assert_eq!(examples.iter().filter(|e| !e.is_conditional()).count(), 3);
    }

    #[rstest]
    fn test_augmented_mapping_single_record() {
        let records = vec![PreferenceRecord::new("p0", "c0", "r0")];
        let examples = return_prompt_and_responses_augmented(&records, &PlainPromptFormatter);
        assert_eq!(examples, vec![PreferenceExample::new("p0", "c0", "p0", "r0")]);
    }

    #[rstest]
    fn test_augmented_mapping_skips_same_prompt_cross_pairs() {
        let records = vec![
            PreferenceRecord::new("p", "c0", "r0"),
            PreferenceRecord::new("p", "c1", "r1"),
        ];
        let examples = return_prompt_and_responses_augmented(&records, &PlainPromptFormatter);
        assert_eq!(examples.len(), 2);
        assert!(examples.iter().all(PreferenceExample::is_conditional));
    }

    #[rstest]
    fn test_augmented_mapping_passes_joint_records_through() {
        let records = vec![
            PreferenceRecord::new("p0", "c0", "r0").with_rejected_prompt("q0"),
            PreferenceRecord::new("p1", "c1", "r1"),
        ];
        let examples = return_prompt_and_responses_augmented(&records, &PlainPromptFormatter);
        assert_eq!(examples[0], PreferenceExample::new("p0", "c0", "q0", "r0"));
        // the cross pair borrows the joint record's rejected side
        assert_eq!(examples[2], PreferenceExample::new("p1", "c1", "q0", "r0"));
        assert_eq!(examples.len(), 3);
    }

    #[rstest]
    fn test_formatter_is_applied_to_both_prompts(records: Vec<PreferenceRecord>) {
        let examples = return_prompt_and_responses_augmented(&records, &AlpacaPromptFormatter);
        assert!(examples[1].chosen_prompt.contains("### Instruction:\np0"));
        assert!(examples[1].rejected_prompt.contains("### Instruction:\np1"));
    }

    #[rstest]
    fn test_map_batched_keeps_cross_pairs_within_chunks(records: Vec<PreferenceRecord>) {
        let examples = map_batched(&records, 2, true, &PlainPromptFormatter);
        // chunk [p0, p1] gives 4 examples, chunk [p2] gives 1
        assert_eq!(examples.len(), 5);
        assert_eq!(examples[3], PreferenceExample::new("p1", "c1", "p0", "r0"));

        let conditional = map_batched(&records, 2, false, &PlainPromptFormatter);
        assert_eq!(conditional.len(), 3);
    }
}
