use anyhow::bail;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use jpo_rs::{
    config::{run_name, ScriptArguments},
    data::{prepare_split, PreferenceCollator, PreferenceDataLoader, SplitSummary},
    jpo::{JpoTrainer, TrainingArguments},
    model::{
        hub::{load_pretrained_gpt2, resolve_model_files},
        lora::LoRAConfig,
    },
};
use std::path::PathBuf;
use tiktoken_rs::get_bpe_from_model;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI
#[derive(Debug, Parser)]
#[command(name = "jpo")]
#[command(about = "Preference fine-tuning of causal LMs with LoRA and the JPO loss.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load the model and data, train adapters and save them
    Train(ScriptArguments),
    /// Run only preprocessing and print per-split statistics
    InspectData(ScriptArguments),
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train(args),
        Commands::InspectData(args) => inspect_data(args),
    }
}

fn train(mut args: ScriptArguments) -> anyhow::Result<()> {
    args.validate()?;
    let output_dir = PathBuf::from(args.resolve_output_dir());
    std::fs::create_dir_all(&output_dir)?;
    args.save_json(&output_dir)?;
    tracing::info!(
        run_name = %run_name(&args),
        output_dir = %output_dir.display(),
        joint = args.joint_distribution,
        "starting run"
    );
    if args.gradient_checkpointing {
        tracing::debug!("gradient_checkpointing is accepted but has no effect");
    }
    if args.ignore_bias_buffers {
        tracing::debug!("ignore_bias_buffers is accepted but has no effect");
    }

    let device = Device::cuda_if_available(0)?;
    if device.is_cuda() {
        device.set_seed(args.seed)?;
    }

    // 1. load the pretrained model and attach adapters
    let files = resolve_model_files(
        &args.model_name_or_path,
        args.cache_dir.as_deref(),
        args.hf_token.as_deref(),
    )?;
    let (cfg, mut model) = load_pretrained_gpt2(&files, &device)?;
    if args.max_length > cfg.context_length {
        bail!(
            "max_length ({}) exceeds the model's context length ({})",
            args.max_length,
            cfg.context_length
        );
    }
    let lora_config = LoRAConfig::new(args.lora_r, args.lora_alpha, args.lora_dropout)
        .base_model_name_or_path(&args.model_name_or_path);
    let lora_varmap = VarMap::new();
    let lora_vb = VarBuilder::from_varmap(&lora_varmap, DType::F32, &device);
    model.attach_lora(&lora_config, lora_vb)?;
    let trainable = lora_varmap
        .all_vars()
        .iter()
        .map(|v| v.elem_count())
        .sum::<usize>();
    tracing::info!(trainable_params = trainable, "attached LoRA adapters");

    // 2. and 3. training and evaluation data
    let tokenizer = get_bpe_from_model("gpt2")?;
    let (train_dataset, train_summary) = prepare_split(&args.dataset_name, &args, &tokenizer)?;
    let (eval_dataset, eval_summary) =
        prepare_split(&args.eval_dataset_name, &args, &tokenizer)?;
    tracing::info!(
        train = train_summary.kept,
        eval = eval_summary.kept,
        "prepared datasets"
    );

    let collator = PreferenceCollator::new().device(device.clone());
    let train_loader = PreferenceDataLoader::new(
        train_dataset,
        args.per_device_train_batch_size,
        true,
        collator.clone(),
    )
    .seed(args.seed);
    let eval_loader = PreferenceDataLoader::new(
        eval_dataset,
        args.per_device_eval_batch_size,
        false,
        collator,
    );

    // 4. train
    let mut trainer = JpoTrainer::new(
        model,
        lora_varmap,
        lora_config,
        TrainingArguments::from(&args),
        train_loader,
        Some(eval_loader),
        device,
    )?;
    trainer.train()?;

    // 5. save
    trainer.save_model(&output_dir)?;
    trainer.save_model(output_dir.join("final_checkpoint"))?;
    Ok(())
}

fn inspect_data(args: ScriptArguments) -> anyhow::Result<()> {
    args.validate()?;
    let tokenizer = get_bpe_from_model("gpt2")?;

    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "split",
        "records",
        "skipped",
        "examples",
        "cross-prompt",
        "filtered",
        "kept",
        "min len",
        "max len",
        "mean len",
    ]);
    for (split, path) in [
        ("train", &args.dataset_name),
        ("eval", &args.eval_dataset_name),
    ] {
        let (_dataset, summary) = prepare_split(path, &args, &tokenizer)?;
        table.add_row(summary_row(split, &summary));
    }
    println!("{table}");
    Ok(())
}

fn summary_row(split: &str, summary: &SplitSummary) -> Vec<Cell> {
    vec![
        Cell::new(split),
        Cell::new(summary.records),
        Cell::new(summary.skipped),
        Cell::new(summary.examples),
        Cell::new(summary.cross_prompt),
        Cell::new(summary.filtered()),
        Cell::new(summary.kept),
        Cell::new(summary.min_len),
        Cell::new(summary.max_len),
        Cell::new(format!("{:.1}", summary.mean_len)),
    ]
}
