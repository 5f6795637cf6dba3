//! Script configuration
//!
//! `ScriptArguments` is the flat record of hyperparameters every stage of a
//! run reads from. It is parsed once from the command line and treated as
//! immutable afterwards, apart from `resolve_output_dir` filling in a default
//! output directory.

use anyhow::{bail, Context};
use clap::{ArgAction, Args, ValueEnum};
use serde::Serialize;
use std::{fmt::Display, fs::File, io::BufWriter, path::Path};

/// Records from each split kept when `sanity_check` is set
pub const SANITY_CHECK_NUM_RECORDS: usize = 100;

/// Learning-rate schedule applied after warmup
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    #[value(name = "cosine")]
    Cosine,
    #[value(name = "linear")]
    Linear,
    #[value(name = "constant")]
    Constant,
    #[value(name = "constant_with_warmup")]
    ConstantWithWarmup,
}

impl Display for LrSchedulerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cosine => "cosine",
            Self::Linear => "linear",
            Self::Constant => "constant",
            Self::ConstantWithWarmup => "constant_with_warmup",
        };
        write!(f, "{name}")
    }
}

/// Optimizer used for the adapter weights
///
/// The paged variants map onto plain AdamW: candle keeps optimizer state in
/// device memory and has no paging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerType {
    #[value(name = "adamw_torch")]
    AdamwTorch,
    #[value(name = "paged_adamw_32bit")]
    PagedAdamw32bit,
    #[value(name = "sgd")]
    Sgd,
}

/// Where training metrics get reported besides the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportTo {
    #[value(name = "none")]
    None,
    /// Writes `loss_plot.html` into the output directory
    #[value(name = "plot")]
    Plot,
}

/// Prompt template applied to raw prompts before tokenization
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    /// Prompts are used verbatim
    #[value(name = "plain")]
    Plain,
    /// Alpaca-style `### Instruction:` / `### Response:` wrapping
    #[value(name = "alpaca")]
    Alpaca,
}

/// The arguments for the JPO training script
#[derive(Debug, Clone, Args, Serialize)]
pub struct ScriptArguments {
    /// The beta parameter for the JPO loss
    #[arg(long, default_value_t = 0.1)]
    pub beta: f64,

    /// The location of the SFT model name or path
    #[arg(long, default_value = "mistral_7b_lr_1.5e-6_sft")]
    pub model_name_or_path: String,

    /// JSON-lines file with training preference pairs
    #[arg(long, default_value = "train_pref.jsonl")]
    pub dataset_name: String,

    /// JSON-lines file with evaluation preference pairs
    #[arg(long, default_value = "val_pref.jsonl")]
    pub eval_dataset_name: String,

    /// Optimizer learning rate
    #[arg(long, default_value_t = 5e-5)]
    pub learning_rate: f64,

    /// The lr scheduler type
    #[arg(long, value_enum, default_value_t = LrSchedulerType::Cosine)]
    pub lr_scheduler_type: LrSchedulerType,

    /// The number of warmup steps
    #[arg(long, default_value_t = 100)]
    pub warmup_steps: usize,

    /// The weight decay
    #[arg(long, default_value_t = 0.05)]
    pub weight_decay: f64,

    /// The optimizer type
    #[arg(long, value_enum, default_value_t = OptimizerType::PagedAdamw32bit)]
    pub optimizer_type: OptimizerType,

    /// Train batch size per device
    #[arg(long, default_value_t = 8)]
    pub per_device_train_batch_size: usize,

    /// Eval batch size per device
    #[arg(long, default_value_t = 8)]
    pub per_device_eval_batch_size: usize,

    /// The number of gradient accumulation steps
    #[arg(long, default_value_t = 4)]
    pub gradient_accumulation_steps: usize,

    /// Accepted for compatibility; candle has no activation checkpointing
    #[arg(long, default_value_t = true, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    pub gradient_checkpointing: bool,

    /// The lora alpha parameter
    #[arg(long, default_value_t = 16.0)]
    pub lora_alpha: f64,

    /// The lora dropout parameter
    #[arg(long, default_value_t = 0.05)]
    pub lora_dropout: f32,

    /// The lora r parameter
    #[arg(long, default_value_t = 8)]
    pub lora_r: usize,

    /// The maximum prompt length
    #[arg(long, default_value_t = 512)]
    pub max_prompt_length: usize,

    /// The maximum sequence length
    #[arg(long, default_value_t = 1024)]
    pub max_length: usize,

    /// Max number of training steps
    #[arg(long, default_value_t = 1000)]
    pub max_steps: usize,

    /// The logging frequency, in optimizer steps
    #[arg(long, default_value_t = 10)]
    pub logging_steps: usize,

    /// The saving frequency, in optimizer steps
    #[arg(long, default_value_t = 300)]
    pub save_steps: usize,

    /// The evaluation frequency, in optimizer steps
    #[arg(long, default_value_t = 300)]
    pub eval_steps: usize,

    /// The output directory; derived from the other arguments when empty
    #[arg(long, default_value = "")]
    pub output_dir: String,

    /// Per micro-batch debug logging frequency
    #[arg(long, default_value_t = 1)]
    pub log_freq: usize,

    /// Trains on joint distribution as objective instead of conditional
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    pub joint_distribution: bool,

    /// Only train on 100 samples
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    pub sanity_check: bool,

    /// Integration to report the results and logs to
    #[arg(long, value_enum, default_value_t = ReportTo::None)]
    pub report_to: ReportTo,

    /// Accepted for compatibility; only meaningful for multi-process training
    #[arg(long, default_value_t = false, num_args = 0..=1, default_missing_value = "true", action = ArgAction::Set)]
    pub ignore_bias_buffers: bool,

    /// Model cache directory
    #[arg(long, env = "HF_HOME")]
    pub cache_dir: Option<String>,

    /// Hub authentication token
    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    #[serde(skip_serializing)]
    pub hf_token: Option<String>,

    /// Prompt template
    #[arg(long, value_enum, default_value_t = PromptStyle::Plain)]
    pub prompt_style: PromptStyle,

    /// Worker threads used for tokenization
    #[arg(long, default_value_t = 24)]
    pub preprocessing_num_workers: usize,

    /// Records handed to each call of the mapping function
    #[arg(long, default_value_t = 1000)]
    pub map_batch_size: usize,

    /// Seed for data shuffling and, on CUDA, adapter initialization
    #[arg(long, default_value_t = 42)]
    pub seed: u64,
}

impl ScriptArguments {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.beta <= 0.0 {
            bail!("beta must be positive, got {}", self.beta);
        }
        if self.learning_rate <= 0.0 {
            bail!("learning_rate must be positive, got {}", self.learning_rate);
        }
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            bail!("batch sizes must be at least 1");
        }
        if self.gradient_accumulation_steps == 0 {
            bail!("gradient_accumulation_steps must be at least 1");
        }
        if self.max_steps == 0 {
            bail!("max_steps must be at least 1");
        }
        if self.lora_r == 0 {
            bail!("lora_r must be at least 1");
        }
        if !(0.0..1.0).contains(&self.lora_dropout) {
            bail!("lora_dropout must be in [0, 1), got {}", self.lora_dropout);
        }
        if self.max_prompt_length >= self.max_length {
            bail!(
                "max_prompt_length ({}) must be smaller than max_length ({})",
                self.max_prompt_length,
                self.max_length
            );
        }
        if self.logging_steps == 0 || self.save_steps == 0 || self.eval_steps == 0 {
            bail!("logging_steps, save_steps and eval_steps must be at least 1");
        }
        if self.map_batch_size == 0 {
            bail!("map_batch_size must be at least 1");
        }
        Ok(())
    }

    /// Fills in `output_dir` with `default_output_dir` when it is (nearly) empty
    pub fn resolve_output_dir(&mut self) -> &str {
        if self.output_dir.chars().count() <= 1 {
            self.output_dir = default_output_dir(self);
        }
        &self.output_dir
    }

    /// Writes the arguments (minus the token) as `script_args.json`
    pub fn save_json<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        let path = dir.as_ref().join("script_args.json");
        let file = File::create(&path)
            .with_context(|| format!("Unable to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)?;
        Ok(())
    }
}

fn sanitized_model_name(model_name_or_path: &str) -> String {
    model_name_or_path
        .replace("../", "")
        .replace("..", "")
        .replace('/', "_")
}

/// Output directory derived from model, dataset, learning rate, scheduler,
/// batch size and step count
pub fn default_output_dir(args: &ScriptArguments) -> String {
    let model_name = sanitized_model_name(&args.model_name_or_path);
    let dataset_name = args.dataset_name.replace('/', "_");
    format!(
        "{}_{}_lr{}_{}_b{}_step{}",
        model_name,
        dataset_name,
        format_float(args.learning_rate),
        args.lr_scheduler_type,
        args.per_device_train_batch_size,
        args.max_steps
    )
}

/// Name attached to the run in logs and `trainer_state.json`
pub fn run_name(args: &ScriptArguments) -> String {
    let joint = if args.joint_distribution {
        "True"
    } else {
        "False"
    };
    format!(
        "name_{}_{}_bsz={}_joint={}",
        args.output_dir, args.model_name_or_path, args.per_device_train_batch_size, joint
    )
}

/// Shortest round-trip float formatting with scientific notation below 1e-4
/// and from 1e16 upwards (`5e-05`, `0.0001`, `1.0`).
///
/// Checkpoint directories produced by earlier runs use this convention, so
/// directory names stay comparable across tools.
pub fn format_float(value: f64) -> String {
    if !value.is_finite() {
        return format!("{value}");
    }
    let magnitude = value.abs();
    if value != 0.0 && !(1e-4..1e16).contains(&magnitude) {
        let sci = format!("{value:e}");
        let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
        let (sign, digits) = match exponent.strip_prefix('-') {
            Some(d) => ('-', d),
            None => ('+', exponent),
        };
        format!("{mantissa}e{sign}{digits:0>2}")
    } else {
        let plain = format!("{value}");
        if plain.contains('.') {
            plain
        } else {
            format!("{plain}.0")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use rstest::*;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        args: ScriptArguments,
    }

    #[fixture]
    fn args() -> ScriptArguments {
        TestCli::parse_from(["jpo"]).args
    }

    #[rstest]
    fn test_defaults_match_script(args: ScriptArguments) {
        assert_eq!(args.beta, 0.1);
        assert_eq!(args.learning_rate, 5e-5);
        assert_eq!(args.lr_scheduler_type, LrSchedulerType::Cosine);
        assert_eq!(args.per_device_train_batch_size, 8);
        assert_eq!(args.gradient_accumulation_steps, 4);
        assert_eq!(args.lora_r, 8);
        assert_eq!(args.max_length, 1024);
        assert!(args.gradient_checkpointing);
        assert!(!args.joint_distribution);
        assert_eq!(args.report_to, ReportTo::None);
    }

    #[rstest]
    fn test_bool_flags_accept_bare_and_valued_forms() {
        let cli = TestCli::parse_from([
            "jpo",
            "--joint-distribution",
            "--gradient-checkpointing",
            "false",
        ]);
        assert!(cli.args.joint_distribution);
        assert!(!cli.args.gradient_checkpointing);
    }

    #[rstest]
    #[case(5e-5, "5e-05")]
    #[case(1.5e-6, "1.5e-06")]
    #[case(1e-4, "0.0001")]
    #[case(0.001, "0.001")]
    #[case(1.0, "1.0")]
    #[case(2e16, "2e+16")]
    fn test_format_float(#[case] value: f64, #[case] expected: &str) {
        assert_eq!(format_float(value), expected);
    }

    #[rstest]
    fn test_default_output_dir(mut args: ScriptArguments) {
        args.model_name_or_path = "../models/gpt2/sft".to_string();
        args.dataset_name = "../data/tldr/train.jsonl".to_string();
        let expected = "models_gpt2_sft_.._data_tldr_train.jsonl_lr5e-05_cosine_b8_step1000";
        assert_eq!(default_output_dir(&args), expected);
        // a pure function of its inputs
        assert_eq!(default_output_dir(&args), default_output_dir(&args.clone()));
    }

    #[rstest]
    fn test_resolve_output_dir_keeps_explicit_dir(mut args: ScriptArguments) {
        args.output_dir = "runs/explicit".to_string();
        assert_eq!(args.resolve_output_dir(), "runs/explicit");

        args.output_dir = "/".to_string();
        let resolved = args.resolve_output_dir().to_string();
        assert_eq!(resolved, default_output_dir(&args));
    }

    #[rstest]
    fn test_run_name(mut args: ScriptArguments) {
        args.output_dir = "out".to_string();
        args.model_name_or_path = "gpt2".to_string();
        args.joint_distribution = true;
        assert_eq!(run_name(&args), "name_out_gpt2_bsz=8_joint=True");
    }

    #[rstest]
    fn test_validate(mut args: ScriptArguments) {
        assert!(args.validate().is_ok());
        args.max_prompt_length = args.max_length;
        assert!(args.validate().is_err());
    }

    #[rstest]
    fn test_save_json_skips_token(mut args: ScriptArguments) -> anyhow::Result<()> {
        args.hf_token = Some("secret".to_string());
        let dir = tempfile::tempdir()?;
        args.save_json(dir.path())?;
        let contents = std::fs::read_to_string(dir.path().join("script_args.json"))?;
        assert!(contents.contains("\"beta\""));
        assert!(!contents.contains("secret"));
        Ok(())
    }
}
