//! Preference data: loading, mapping, tokenization, filtering and batching
//!
//! The pipeline runs `load_jsonl` → `map_batched` (conditional or joint
//! mapping) → `encode_examples` → `filter_long_sequences` →
//! `PreferenceDataset` → `PreferenceDataLoader`.

pub mod augment;
pub mod dataset;
pub mod loader;

use crate::config::{PromptStyle, ScriptArguments, SANITY_CHECK_NUM_RECORDS};
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DefaultOnNull, NoneAsEmptyString};
use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::Path,
};
use thiserror::Error;
use tiktoken_rs::CoreBPE;

pub use augment::{
    map_batched, return_prompt_and_responses, return_prompt_and_responses_augmented,
    PreferenceExample,
};
pub use dataset::{encode_examples, filter_long_sequences, EncodedPreferenceExample, PreferenceDataset};
pub use loader::{PreferenceBatch, PreferenceCollator, PreferenceDataLoader};

/// Label value excluded from the log-likelihood
pub const DEFAULT_IGNORE_INDEX: i64 = -100;
/// GPT-2 `<|endoftext|>`, doubling as the padding token
pub const DEFAULT_PAD_TOKEN_ID: u32 = 50_256;

/// Why a raw record was rejected
#[derive(Debug, Error, PartialEq)]
pub enum DataError {
    #[error("line {line}: malformed JSON: {message}")]
    MalformedJson { line: usize, message: String },
    #[error("line {line}: field `{field}` is missing or empty")]
    MissingField { line: usize, field: &'static str },
}

/// One JSON-lines row of preference data
///
/// `rejected_prompt` marks a natively joint record whose dispreferred
/// response answers a different prompt than the preferred one.
#[serde_as]
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreferenceRecord {
    pub prompt: String,
    #[serde(default)]
    pub chosen: String,
    #[serde(default)]
    pub rejected: String,
    #[serde_as(as = "DefaultOnNull<NoneAsEmptyString>")]
    #[serde(default)]
    pub rejected_prompt: Option<String>,
}

impl PreferenceRecord {
    pub fn new(prompt: &str, chosen: &str, rejected: &str) -> Self {
        Self {
            prompt: prompt.to_string(),
            chosen: chosen.to_string(),
            rejected: rejected.to_string(),
            rejected_prompt: None,
        }
    }

    pub fn with_rejected_prompt(mut self, rejected_prompt: &str) -> Self {
        self.rejected_prompt = Some(rejected_prompt.to_string());
        self
    }

    /// Whether the two responses answer different prompts
    pub fn is_joint(&self) -> bool {
        self.rejected_prompt
            .as_ref()
            .is_some_and(|p| p != &self.prompt)
    }

    fn validate(&self, line: usize) -> Result<(), DataError> {
        if self.chosen.trim().is_empty() {
            return Err(DataError::MissingField {
                line,
                field: "chosen",
            });
        }
        if self.rejected.trim().is_empty() {
            return Err(DataError::MissingField {
                line,
                field: "rejected",
            });
        }
        Ok(())
    }
}

/// Parses one JSON-lines row; `line` is 1-based and only used in errors
pub fn parse_record(text: &str, line: usize) -> Result<PreferenceRecord, DataError> {
    let record: PreferenceRecord =
        serde_json::from_str(text).map_err(|e| DataError::MalformedJson {
            line,
            message: e.to_string(),
        })?;
    record.validate(line)?;
    Ok(record)
}

/// Records read from a file plus the rows that were skipped
#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub records: Vec<PreferenceRecord>,
    pub skipped: Vec<DataError>,
}

/// Reads a JSON-lines preference file.
///
/// Blank lines are ignored. Malformed rows are skipped and reported in
/// `LoadedRecords::skipped`; a file without a single valid row is an error.
pub fn load_jsonl<P: AsRef<Path>>(path: P) -> anyhow::Result<LoadedRecords> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| anyhow::anyhow!("Unable to open {}: {e}", path.display()))?;
    let mut loaded = LoadedRecords::default();
    for (ix, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match parse_record(&line, ix + 1) {
            Ok(record) => loaded.records.push(record),
            Err(e) => {
                tracing::warn!(file = %path.display(), "skipping record: {e}");
                loaded.skipped.push(e);
            }
        }
    }
    if loaded.records.is_empty() {
        anyhow::bail!("{} contains no valid preference records", path.display());
    }
    tracing::info!(
        file = %path.display(),
        records = loaded.records.len(),
        skipped = loaded.skipped.len(),
        "loaded preference data"
    );
    Ok(loaded)
}

/// Prompt templates, applied before tokenization
pub trait PromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String;
}

/// Leaves prompts untouched; for datasets whose prompts already carry a template
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainPromptFormatter;

impl PromptFormatter for PlainPromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String {
        prompt.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlpacaPromptFormatter;

impl PromptFormatter for AlpacaPromptFormatter {
    fn format_prompt(&self, prompt: &str) -> String {
        format!(
            "Below is an instruction that describes a task. Write a response \
            that appropriately completes the request.\n\n\
            ### Instruction:\n{prompt}\n\n### Response:\n"
        )
    }
}

/// Formatter for the configured prompt style
pub fn prompt_formatter(style: PromptStyle) -> Box<dyn PromptFormatter> {
    match style {
        PromptStyle::Plain => Box::new(PlainPromptFormatter),
        PromptStyle::Alpaca => Box::new(AlpacaPromptFormatter),
    }
}

/// What happened to one split on its way to the trainer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitSummary {
    pub records: usize,
    pub skipped: usize,
    pub examples: usize,
    pub cross_prompt: usize,
    pub kept: usize,
    pub min_len: usize,
    pub max_len: usize,
    pub mean_len: f64,
}

impl SplitSummary {
    pub fn filtered(&self) -> usize {
        self.examples - self.kept
    }
}

/// Loads, maps, tokenizes and length-filters one JSON-lines split
pub fn prepare_split<P: AsRef<Path>>(
    path: P,
    args: &ScriptArguments,
    tokenizer: &CoreBPE,
) -> anyhow::Result<(PreferenceDataset, SplitSummary)> {
    let LoadedRecords {
        mut records,
        skipped,
    } = load_jsonl(path)?;
    if args.sanity_check {
        records.truncate(SANITY_CHECK_NUM_RECORDS);
    }

    let formatter = prompt_formatter(args.prompt_style);
    let examples = map_batched(
        &records,
        args.map_batch_size,
        args.joint_distribution,
        formatter.as_ref(),
    );
    let encoded = encode_examples(
        &examples,
        tokenizer,
        args.max_prompt_length,
        args.joint_distribution,
        args.preprocessing_num_workers,
    )?;
    let kept = filter_long_sequences(encoded, args.max_length);

    let lengths = kept.iter().map(EncodedPreferenceExample::max_len).collect_vec();
    let (min_len, max_len) = match lengths.iter().minmax() {
        MinMaxResult::NoElements => (0, 0),
        MinMaxResult::OneElement(&l) => (l, l),
        MinMaxResult::MinMax(&lo, &hi) => (lo, hi),
    };
    let mean_len = if lengths.is_empty() {
        0.
    } else {
        lengths.iter().sum::<usize>() as f64 / lengths.len() as f64
    };
    let summary = SplitSummary {
        records: records.len(),
        skipped: skipped.len(),
        examples: examples.len(),
        cross_prompt: examples.iter().filter(|e| !e.is_conditional()).count(),
        kept: kept.len(),
        min_len,
        max_len,
        mean_len,
    };
    Ok((PreferenceDataset::new(kept), summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use rstest::*;
    use std::io::Write;

    #[rstest]
    fn test_parse_record() -> Result<()> {
        let record = parse_record(r#"{"prompt": "p", "chosen": "a", "rejected": "b"}"#, 1)?;
        assert_eq!(record, PreferenceRecord::new("p", "a", "b"));
        assert!(!record.is_joint());
        Ok(())
    }

    #[rstest]
    fn test_parse_joint_record() -> Result<()> {
        let text = r#"{"prompt": "p", "chosen": "a", "rejected": "b", "rejected_prompt": "q"}"#;
        let record = parse_record(text, 1)?;
        assert!(record.is_joint());

        // empty or null rejected_prompt means a conditional record
        let text = r#"{"prompt": "p", "chosen": "a", "rejected": "b", "rejected_prompt": ""}"#;
        assert!(!parse_record(text, 1)?.is_joint());
        let text = r#"{"prompt": "p", "chosen": "a", "rejected": "b", "rejected_prompt": null}"#;
        assert!(!parse_record(text, 1)?.is_joint());
        Ok(())
    }

    #[rstest]
    #[case(r#"{"prompt": "p", "rejected": "b"}"#, DataError::MissingField { line: 3, field: "chosen" })]
    #[case(r#"{"prompt": "p", "chosen": "a", "rejected": "  "}"#, DataError::MissingField { line: 3, field: "rejected" })]
    fn test_parse_record_missing_fields(#[case] text: &str, #[case] expected: DataError) {
        assert_eq!(parse_record(text, 3).unwrap_err(), expected);
    }

    #[rstest]
    #[case(r#"{"question": "q", "chosen": "a", "rejected": "b"}"#)]
    fn test_parse_record_requires_prompt(#[case] text: &str) {
        let err = parse_record(text, 4).unwrap_err();
        assert!(matches!(err, DataError::MalformedJson { line: 4, .. }));
        assert!(err.to_string().contains("prompt"));
    }

    #[rstest]
    fn test_parse_record_malformed_json() {
        let err = parse_record(r#"{"prompt": "p", "chosen": "#, 7).unwrap_err();
        assert!(matches!(err, DataError::MalformedJson { line: 7, .. }));
    }

    #[rstest]
    fn test_load_jsonl_skips_bad_rows() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, r#"{{"prompt": "p1", "chosen": "a", "rejected": "b"}}"#)?;
        writeln!(file)?;
        writeln!(file, "not json")?;
        writeln!(file, r#"{{"prompt": "p2", "chosen": "", "rejected": "b"}}"#)?;
        writeln!(file, r#"{{"prompt": "p3", "chosen": "c", "rejected": "d"}}"#)?;

        let loaded = load_jsonl(file.path())?;
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.skipped.len(), 2);
        assert_eq!(loaded.records[1].prompt, "p3");
        Ok(())
    }

    #[rstest]
    fn test_load_jsonl_without_valid_rows_errors() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "{{}}")?;
        assert!(load_jsonl(file.path()).is_err());
        Ok(())
    }

    fn script_args(extra: &[&str]) -> ScriptArguments {
        use clap::Parser;

        #[derive(Parser)]
        struct TestCli {
            #[command(flatten)]
            args: ScriptArguments,
        }
        let argv = std::iter::once("jpo").chain(extra.iter().copied());
        TestCli::parse_from(argv).args
    }

    fn write_records(n: usize) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::NamedTempFile::new()?;
        for ix in 0..n {
            let record = PreferenceRecord::new(
                &format!("Summarize post number {ix}."),
                " A short summary.",
                &" A rambling and much longer answer that goes on.".repeat(ix % 3 + 1),
            );
            writeln!(file, "{}", serde_json::to_string(&record)?)?;
        }
        Ok(file)
    }

    #[rstest]
    fn test_prepare_split_respects_max_length() -> Result<()> {
        let file = write_records(6)?;
        let tokenizer = tiktoken_rs::get_bpe_from_model("gpt2")?;
        let args = script_args(&["--max-prompt-length", "16", "--max-length", "30"]);

        let (dataset, summary) = prepare_split(file.path(), &args, &tokenizer)?;
        assert_eq!(summary.records, 6);
        assert_eq!(summary.examples, 6);
        assert_eq!(summary.cross_prompt, 0);
        assert!(summary.filtered() > 0);
        assert_eq!(dataset.len(), summary.kept);
        assert!(summary.max_len <= 30);
        assert!(dataset.encoded_texts().iter().all(|e| e.max_len() <= 30));
        Ok(())
    }

    #[rstest]
    fn test_prepare_split_joint_and_sanity_check() -> Result<()> {
        let file = write_records(120)?;
        let tokenizer = tiktoken_rs::get_bpe_from_model("gpt2")?;
        let args = script_args(&[
            "--joint-distribution",
            "--sanity-check",
            "--map-batch-size",
            "50",
            "--preprocessing-num-workers",
            "4",
        ]);

        let (dataset, summary) = prepare_split(file.path(), &args, &tokenizer)?;
        assert_eq!(summary.records, SANITY_CHECK_NUM_RECORDS);
        assert_eq!(summary.examples, 2 * SANITY_CHECK_NUM_RECORDS);
        assert_eq!(summary.cross_prompt, SANITY_CHECK_NUM_RECORDS);
        assert_eq!(dataset.len(), summary.kept);
        Ok(())
    }

    #[rstest]
    fn test_alpaca_formatter() {
        let formatted = AlpacaPromptFormatter.format_prompt("Say hi.");
        assert!(formatted.contains("### Instruction:\nSay hi."));
        assert!(formatted.ends_with("### Response:\n"));
        assert_eq!(PlainPromptFormatter.format_prompt("Say hi."), "Say hi.");
    }
}
