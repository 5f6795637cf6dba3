//! Joint Preference Optimization
//!
//! `loss` holds the objective and sequence scoring, `trainer` the loop that
//! optimises LoRA adapters against it.

pub mod loss;
pub mod trainer;

use crate::config::{run_name, LrSchedulerType, OptimizerType, ReportTo, ScriptArguments};
use std::path::PathBuf;

pub use loss::{get_batch_logps, jpo_loss, JpoMetrics};
pub use trainer::{JpoTrainer, ReferenceLogps};

pub const ADAPTER_WEIGHTS_FILENAME: &str = "adapter_model.safetensors";
pub const ADAPTER_CONFIG_FILENAME: &str = "adapter_config.json";

/// Settings the trainer reads, split off from `ScriptArguments`
#[derive(Debug, Clone)]
pub struct TrainingArguments {
    pub output_dir: PathBuf,
    pub run_name: String,
    pub beta: f64,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub optimizer_type: OptimizerType,
    pub lr_scheduler_type: LrSchedulerType,
    pub warmup_steps: usize,
    pub max_steps: usize,
    pub gradient_accumulation_steps: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub eval_steps: usize,
    pub log_freq: usize,
    pub report_to: ReportTo,
    pub seed: u64,
}

impl From<&ScriptArguments> for TrainingArguments {
    fn from(args: &ScriptArguments) -> Self {
        Self {
            output_dir: PathBuf::from(&args.output_dir),
            run_name: run_name(args),
            beta: args.beta,
            learning_rate: args.learning_rate,
            weight_decay: args.weight_decay,
            optimizer_type: args.optimizer_type,
            lr_scheduler_type: args.lr_scheduler_type,
            warmup_steps: args.warmup_steps,
            max_steps: args.max_steps,
            gradient_accumulation_steps: args.gradient_accumulation_steps,
            per_device_train_batch_size: args.per_device_train_batch_size,
            per_device_eval_batch_size: args.per_device_eval_batch_size,
            logging_steps: args.logging_steps,
            save_steps: args.save_steps,
            eval_steps: args.eval_steps,
            log_freq: args.log_freq,
            report_to: args.report_to,
            seed: args.seed,
        }
    }
}
