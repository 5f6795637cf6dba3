//! The JPO training loop over LoRA adapters

use super::{
    get_batch_logps, jpo_loss, JpoMetrics, TrainingArguments, ADAPTER_CONFIG_FILENAME,
    ADAPTER_WEIGHTS_FILENAME,
};
use crate::{
    config::{OptimizerType, ReportTo},
    data::{loader::DataLoader, PreferenceBatch, PreferenceDataLoader, DEFAULT_IGNORE_INDEX},
    model::{lora::LoRAConfig, GPTModel},
    report::{plot_losses, LogEntry, TrainerState, LOSS_PLOT_FILENAME, TRAINER_STATE_FILENAME},
    scheduler::LearningRateScheduler,
};
use anyhow::{anyhow, bail, Context};
use candle_core::{backprop::GradStore, Device, ModuleT, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap, SGD};
use std::{fs::File, io::BufWriter, path::Path};

/// Chosen and rejected rows of `batch` in one forward pass, scored as
/// `(chosen_logps, rejected_logps)`
pub fn concatenated_forward(
    model: &GPTModel,
    batch: &PreferenceBatch,
    train: bool,
) -> candle_core::Result<(Tensor, Tensor)> {
    let (input_ids, labels) = batch.concatenated()?;
    let logits = model.forward_t(&input_ids, train)?;
    let all_logps = get_batch_logps(&logits, &labels, DEFAULT_IGNORE_INDEX)?;
    let n = batch.batch_size();
    Ok((all_logps.narrow(0, 0, n)?, all_logps.narrow(0, n, n)?))
}

/// Log-probabilities of the untrained model, indexed by dataset position
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceLogps {
    chosen: Vec<f32>,
    rejected: Vec<f32>,
}

impl ReferenceLogps {
    /// Scores every example of the loader's dataset with adapters in eval mode.
    ///
    /// Freshly attached adapters have `B = 0`, so before the first optimizer
    /// step this is exactly the frozen base model.
    pub fn compute(model: &GPTModel, loader: &PreferenceDataLoader) -> anyhow::Result<Self> {
        let n = loader.dataset().len();
        let mut chosen = vec![0f32; n];
        let mut rejected = vec![0f32; n];
        for batch in loader.batcher() {
            let batch = batch?;
            let (c, r) = concatenated_forward(model, &batch, false)?;
            for ((&ix, c), r) in batch
                .indices
                .iter()
                .zip(c.to_vec1::<f32>()?)
                .zip(r.to_vec1::<f32>()?)
            {
                chosen[ix] = c;
                rejected[ix] = r;
            }
        }
        Ok(Self { chosen, rejected })
    }

    pub fn len(&self) -> usize {
        self.chosen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chosen.is_empty()
    }

    pub fn chosen(&self) -> &[f32] {
        &self.chosen
    }

    pub fn rejected(&self) -> &[f32] {
        &self.rejected
    }

    /// `(chosen, rejected)` tensors for the given dataset positions
    pub fn gather(&self, indices: &[usize], device: &Device) -> anyhow::Result<(Tensor, Tensor)> {
        let pick = |values: &[f32]| -> anyhow::Result<Tensor> {
            let picked = indices
                .iter()
                .map(|&ix| {
                    values
                        .get(ix)
                        .copied()
                        .ok_or_else(|| anyhow!("No reference log-prob for example {ix}"))
                })
                .collect::<anyhow::Result<Vec<_>>>()?;
            Ok(Tensor::new(picked, device)?)
        };
        Ok((pick(&self.chosen)?, pick(&self.rejected)?))
    }
}

enum AdapterOptimizer {
    AdamW(AdamW),
    Sgd(SGD),
}

impl AdapterOptimizer {
    fn new(
        optimizer_type: OptimizerType,
        vars: Vec<Var>,
        learning_rate: f64,
        weight_decay: f64,
    ) -> candle_core::Result<Self> {
        match optimizer_type {
            // no paged optimizer states in candle; both map onto AdamW
            OptimizerType::AdamwTorch | OptimizerType::PagedAdamw32bit => {
                let params = ParamsAdamW {
                    lr: learning_rate,
                    weight_decay,
                    ..Default::default()
                };
                Ok(Self::AdamW(AdamW::new(vars, params)?))
            }
            OptimizerType::Sgd => Ok(Self::Sgd(SGD::new(vars, learning_rate)?)),
        }
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        match self {
            Self::AdamW(opt) => opt.step(grads),
            Self::Sgd(opt) => opt.step(grads),
        }
    }

    fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::AdamW(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

/// Adds the gradients of `vars` in `grads` into `acc`
fn accumulate_grads(
    acc: &mut Option<GradStore>,
    grads: GradStore,
    vars: &[Var],
) -> candle_core::Result<()> {
    match acc {
        None => *acc = Some(grads),
        Some(acc) => {
            for var in vars {
                if let Some(grad) = grads.get(var) {
                    let summed = match acc.get(var) {
                        Some(prev) => (prev + grad)?,
                        None => grad.clone(),
                    };
                    acc.insert(var, summed);
                }
            }
        }
    }
    Ok(())
}

/// Optimises the LoRA adapters of a `GPTModel` with the JPO loss
pub struct JpoTrainer {
    model: GPTModel,
    lora_varmap: VarMap,
    lora_config: LoRAConfig,
    args: TrainingArguments,
    train_loader: PreferenceDataLoader,
    eval_loader: Option<PreferenceDataLoader>,
    optimizer: AdapterOptimizer,
    scheduler: LearningRateScheduler,
    state: TrainerState,
    train_reference: Option<ReferenceLogps>,
    eval_reference: Option<ReferenceLogps>,
    device: Device,
}

impl JpoTrainer {
    /// `lora_varmap` must hold exactly the adapter variables attached to
    /// `model`; they are the only weights the optimizer sees.
    ///
    /// Dropout of the base model is disabled so that training-mode scores
    /// match the reference scores until the adapters move.
    pub fn new(
        mut model: GPTModel,
        lora_varmap: VarMap,
        lora_config: LoRAConfig,
        args: TrainingArguments,
        train_loader: PreferenceDataLoader,
        eval_loader: Option<PreferenceDataLoader>,
        device: Device,
    ) -> anyhow::Result<Self> {
        let vars = lora_varmap.all_vars();
        if vars.is_empty() {
            bail!("No trainable adapter variables; attach LoRA before building the trainer");
        }
        if train_loader.is_empty() {
            bail!("The training dataset is empty");
        }
        let optimizer = AdapterOptimizer::new(
            args.optimizer_type,
            vars,
            args.learning_rate,
            args.weight_decay,
        )?;
        let scheduler = LearningRateScheduler::new(
            args.learning_rate,
            args.max_steps,
            args.warmup_steps,
            args.lr_scheduler_type,
        );
        model.disable_dropout();
        let state = TrainerState::new(&args.run_name, args.max_steps);
        let eval_loader = eval_loader.filter(|loader| !loader.is_empty());
        Ok(Self {
            model,
            lora_varmap,
            lora_config,
            args,
            train_loader,
            eval_loader,
            optimizer,
            scheduler,
            state,
            train_reference: None,
            eval_reference: None,
            device,
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn train_reference(&self) -> Option<&ReferenceLogps> {
        self.train_reference.as_ref()
    }

    /// Scores both datasets with the current model; a no-op once done.
    ///
    /// Must run before the first optimizer step, while the policy still
    /// equals the reference.
    pub fn precompute_reference_logps(&mut self) -> anyhow::Result<()> {
        let missing_eval = self.eval_reference.is_none() && self.eval_loader.is_some();
        if self.state.global_step > 0 && (self.train_reference.is_none() || missing_eval) {
            bail!("Reference log-probs can only be computed before training starts");
        }
        if self.train_reference.is_none() {
            tracing::info!(
                examples = self.train_loader.dataset().len(),
                "computing reference log-probs for the training set"
            );
            let reference = ReferenceLogps::compute(&self.model, &self.train_loader)?;
            self.train_reference = Some(reference);
        }
        if self.eval_reference.is_none() {
            if let Some(loader) = &self.eval_loader {
                tracing::info!(
                    examples = loader.dataset().len(),
                    "computing reference log-probs for the eval set"
                );
                let reference = ReferenceLogps::compute(&self.model, loader)?;
                self.eval_reference = Some(reference);
            }
        }
        Ok(())
    }

    fn compute_loss(
        &self,
        batch: &PreferenceBatch,
        reference: &ReferenceLogps,
        train: bool,
    ) -> anyhow::Result<(Tensor, JpoMetrics)> {
        let (policy_chosen, policy_rejected) = concatenated_forward(&self.model, batch, train)?;
        let (ref_chosen, ref_rejected) = reference.gather(&batch.indices, &self.device)?;
        Ok(jpo_loss(
            &policy_chosen,
            &policy_rejected,
            &ref_chosen,
            &ref_rejected,
            self.args.beta,
        )?)
    }

    /// Runs optimizer steps until `max_steps` is reached.
    ///
    /// Each step accumulates gradients over `gradient_accumulation_steps`
    /// micro-batches; the data loader is reshuffled at every epoch boundary.
    pub fn train(&mut self) -> anyhow::Result<&TrainerState> {
        self.precompute_reference_logps()?;
        let train_reference = self
            .train_reference
            .clone()
            .ok_or_else(|| anyhow!("Missing training reference log-probs"))?;
        let vars = self.lora_varmap.all_vars();
        let accumulation_steps = self.args.gradient_accumulation_steps.max(1);
        let batches_per_epoch = self.train_loader.len() as f64;

        tracing::info!(
            run_name = %self.args.run_name,
            max_steps = self.args.max_steps,
            examples = self.train_loader.dataset().len(),
            batch_size = self.args.per_device_train_batch_size,
            accumulation_steps,
            trainable_tensors = vars.len(),
            "starting training"
        );

        let mut epoch = 0_usize;
        let mut batches_in_epoch = 0_usize;
        let mut micro_step = 0_usize;
        let mut batcher = self.train_loader.batcher_for_epoch(epoch);
        let mut window: Vec<JpoMetrics> = vec![];

        while self.state.global_step < self.args.max_steps {
            let lr = self.scheduler.current_lr();
            self.optimizer.set_learning_rate(lr);

            let mut grads: Option<GradStore> = None;
            let mut step_metrics = Vec::with_capacity(accumulation_steps);
            for _ in 0..accumulation_steps {
                let batch = match batcher.next() {
                    Some(batch) => batch?,
                    None => {
                        epoch += 1;
                        batches_in_epoch = 0;
                        batcher = self.train_loader.batcher_for_epoch(epoch);
                        batcher
                            .next()
                            .ok_or_else(|| anyhow!("The training dataset is empty"))??
                    }
                };
                batches_in_epoch += 1;
                micro_step += 1;

                let (loss, metrics) = self.compute_loss(&batch, &train_reference, true)?;
                if micro_step % self.args.log_freq.max(1) == 0 {
                    tracing::debug!(
                        micro_step,
                        loss = metrics.loss,
                        accuracy = metrics.rewards_accuracy,
                        "micro-batch"
                    );
                }
                let micro_grads = (loss / accumulation_steps as f64)?.backward()?;
                accumulate_grads(&mut grads, micro_grads, &vars)?;
                step_metrics.push(metrics);
            }
            if let Some(grads) = grads {
                self.optimizer.step(&grads)?;
            }
            self.scheduler.step();
            self.state.global_step += 1;
            self.state.epoch = epoch as f64 + batches_in_epoch as f64 / batches_per_epoch;
            window.push(JpoMetrics::mean(&step_metrics));

            let step = self.state.global_step;
            if step % self.args.logging_steps.max(1) == 0 {
                let metrics = JpoMetrics::mean(&window);
                window.clear();
                tracing::info!(
                    step,
                    epoch = self.state.epoch,
                    lr,
                    loss = metrics.loss,
                    accuracy = metrics.rewards_accuracy,
                    margin = metrics.rewards_margin,
                    "train"
                );
                self.state.log_history.push(LogEntry {
                    step,
                    epoch: self.state.epoch,
                    learning_rate: Some(lr),
                    metrics: metrics.to_map(""),
                });
            }
            if step % self.args.eval_steps.max(1) == 0 {
                self.evaluate()?;
            }
            if step % self.args.save_steps.max(1) == 0 {
                let dir = self.args.output_dir.join(format!("checkpoint-{step}"));
                self.save_model(&dir)?;
            }
        }

        if self.args.report_to == ReportTo::Plot {
            std::fs::create_dir_all(&self.args.output_dir)?;
            plot_losses(&self.state, self.args.output_dir.join(LOSS_PLOT_FILENAME))?;
        }
        tracing::info!(steps = self.state.global_step, "training finished");
        Ok(&self.state)
    }

    /// Mean metrics over the eval set, recorded in the log history.
    /// Returns `None` when there is no eval set.
    pub fn evaluate(&mut self) -> anyhow::Result<Option<JpoMetrics>> {
        if self.eval_loader.is_none() {
            return Ok(None);
        }
        self.precompute_reference_logps()?;
        let (Some(loader), Some(reference)) = (&self.eval_loader, &self.eval_reference) else {
            bail!("Missing eval reference log-probs");
        };

        let mut all_metrics = vec![];
        for batch in loader.batcher() {
            let (_loss, metrics) = self.compute_loss(&batch?, reference, false)?;
            all_metrics.push(metrics);
        }
        let metrics = JpoMetrics::mean(&all_metrics);

        tracing::info!(
            step = self.state.global_step,
            eval_loss = metrics.loss,
            eval_accuracy = metrics.rewards_accuracy,
            eval_margin = metrics.rewards_margin,
            "eval"
        );
        self.state.log_history.push(LogEntry {
            step: self.state.global_step,
            epoch: self.state.epoch,
            learning_rate: None,
            metrics: metrics.to_map("eval_"),
        });
        Ok(Some(metrics))
    }

    /// Writes the adapter weights, adapter config and trainer state into `dir`
    pub fn save_model<P: AsRef<Path>>(&self, dir: P) -> anyhow::Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Unable to create {}", dir.display()))?;
        self.lora_varmap.save(dir.join(ADAPTER_WEIGHTS_FILENAME))?;

        let config_path = dir.join(ADAPTER_CONFIG_FILENAME);
        let file = File::create(&config_path)
            .with_context(|| format!("Unable to create {}", config_path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &self.lora_config)?;

        self.state.save(dir.join(TRAINER_STATE_FILENAME))?;
        tracing::info!(path = %dir.display(), step = self.state.global_step, "saved adapter");
        Ok(())
    }
}
