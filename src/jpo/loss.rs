//! Sequence log-probabilities and the JPO objective

use candle_core::{DType, Result, Tensor, D};
use candle_nn::ops::log_softmax;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Summed next-token log-probabilities of `labels` under `logits`.
///
/// `logits` is `(batch, seq_len, vocab)` and `labels` is `(batch, seq_len)`.
/// Position `t` of the logits scores label `t + 1`; labels equal to
/// `ignore_index` contribute nothing. Returns a `(batch,)` tensor.
pub fn get_batch_logps(logits: &Tensor, labels: &Tensor, ignore_index: i64) -> Result<Tensor> {
    let (_b, seq_len, _vocab) = logits.dims3()?;
    if labels.dims2()?.1 != seq_len {
        candle_core::bail!(
            "logits and labels disagree on sequence length: {:?} vs {:?}",
            logits.dims(),
            labels.dims()
        )
    }
    if seq_len < 2 {
        candle_core::bail!("need at least two positions to score a sequence, got {seq_len}")
    }

    let logits = logits.narrow(1, 0, seq_len - 1)?;
    let labels = labels.narrow(1, 1, seq_len - 1)?.to_dtype(DType::I64)?;

    let log_probs = log_softmax(&logits, D::Minus1)?;
    let valid_mask = labels.ne(ignore_index)?.to_dtype(log_probs.dtype())?;
    // ignored positions gather token 0 and are zeroed by the mask
    let gather_ids = labels.maximum(0i64)?.to_dtype(DType::U32)?;
    let per_token = log_probs
        .gather(&gather_ids.unsqueeze(D::Minus1)?.contiguous()?, D::Minus1)?
        .squeeze(D::Minus1)?;

    (per_token * valid_mask)?.sum(1)
}

/// `log(1 + exp(x))` without overflow for large `x`
fn softplus(xs: &Tensor) -> Result<Tensor> {
    let tail = xs.abs()?.neg()?.exp()?.affine(1., 1.)?.log()?;
    xs.relu()? + tail
}

/// Batch-averaged statistics of one loss evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JpoMetrics {
    pub loss: f32,
    pub rewards_chosen: f32,
    pub rewards_rejected: f32,
    pub rewards_accuracy: f32,
    pub rewards_margin: f32,
    pub logps_chosen: f32,
    pub logps_rejected: f32,
}

impl JpoMetrics {
    /// Unweighted mean over several evaluations
    pub fn mean(metrics: &[JpoMetrics]) -> JpoMetrics {
        if metrics.is_empty() {
            return JpoMetrics::default();
        }
        let n = metrics.len() as f32;
        let avg = |f: fn(&JpoMetrics) -> f32| metrics.iter().map(f).sum::<f32>() / n;
        JpoMetrics {
            loss: avg(|m| m.loss),
            rewards_chosen: avg(|m| m.rewards_chosen),
            rewards_rejected: avg(|m| m.rewards_rejected),
            rewards_accuracy: avg(|m| m.rewards_accuracy),
            rewards_margin: avg(|m| m.rewards_margin),
            logps_chosen: avg(|m| m.logps_chosen),
            logps_rejected: avg(|m| m.logps_rejected),
        }
    }

    /// Metric names as written to the log history, e.g. `eval_rewards/chosen`
    pub fn to_map(&self, prefix: &str) -> BTreeMap<String, f32> {
        [
            ("loss", self.loss),
            ("rewards/chosen", self.rewards_chosen),
            ("rewards/rejected", self.rewards_rejected),
            ("rewards/accuracies", self.rewards_accuracy),
            ("rewards/margins", self.rewards_margin),
            ("logps/chosen", self.logps_chosen),
            ("logps/rejected", self.logps_rejected),
        ]
        .into_iter()
        .map(|(name, value)| (format!("{prefix}{name}"), value))
        .collect()
    }
}

/// The JPO loss `-log sigmoid(beta * ((pi_c - ref_c) - (pi_r - ref_r)))`,
/// averaged over the batch.
///
/// Rewards are `beta * (pi - ref)` for each side. When the two sides carry
/// different prompts the log-probabilities are joint likelihoods of prompt
/// and response, otherwise they are conditional on the shared prompt.
pub fn jpo_loss(
    policy_chosen_logps: &Tensor,
    policy_rejected_logps: &Tensor,
    ref_chosen_logps: &Tensor,
    ref_rejected_logps: &Tensor,
    beta: f64,
) -> Result<(Tensor, JpoMetrics)> {
    let chosen_logratios = (policy_chosen_logps - ref_chosen_logps)?;
    let rejected_logratios = (policy_rejected_logps - ref_rejected_logps)?;
    let logits = ((&chosen_logratios - &rejected_logratios)? * beta)?;
    // -log sigmoid(x) = softplus(-x)
    let loss = softplus(&logits.neg()?)?.mean_all()?;

    let chosen_rewards = (chosen_logratios * beta)?;
    let rejected_rewards = (rejected_logratios * beta)?;
    let rewards_accuracy = chosen_rewards
        .gt(&rejected_rewards)?
        .to_dtype(DType::F32)?
        .mean_all()?
        .to_scalar::<f32>()?;
    let scalar_mean = |t: &Tensor| -> Result<f32> {
        t.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()
    };

    let metrics = JpoMetrics {
        loss: scalar_mean(&loss)?,
        rewards_chosen: scalar_mean(&chosen_rewards)?,
        rewards_rejected: scalar_mean(&rejected_rewards)?,
        rewards_accuracy,
        rewards_margin: scalar_mean(&(&chosen_rewards - &rejected_rewards)?)?,
        logps_chosen: scalar_mean(policy_chosen_logps)?,
        logps_rejected: scalar_mean(policy_rejected_logps)?,
    };
    Ok((loss, metrics))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DEFAULT_IGNORE_INDEX;
    use anyhow::Result;
    use candle_core::Device;
    use rstest::*;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-5,
            "expected {expected}, got {actual}"
        );
    }

    #[rstest]
    fn test_get_batch_logps_masks_ignored_labels() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::zeros((2_usize, 4_usize, 4_usize), DType::F32, &dev)?;
        let labels = Tensor::new(
            &[[DEFAULT_IGNORE_INDEX, 2, 3, DEFAULT_IGNORE_INDEX], [1, 2, 3, 0]],
            &dev,
        )?;
        let logps = get_batch_logps(&logits, &labels, DEFAULT_IGNORE_INDEX)?.to_vec1::<f32>()?;

        let uniform = -(4f32).ln();
        // the first label is never scored
        assert_close(logps[0], 2. * uniform);
        assert_close(logps[1], 3. * uniform);
        Ok(())
    }

    #[rstest]
    fn test_get_batch_logps_gathers_next_token() -> Result<()> {
        let dev = Device::Cpu;
        let ln2 = 2f32.ln();
        // position 0 puts probability 1/2 on token 2
        let logits = Tensor::new(&[[[0f32, 0., ln2], [0., 0., 0.]]], &dev)?;
        let labels = Tensor::new(&[[0i64, 2]], &dev)?;
        let logps = get_batch_logps(&logits, &labels, DEFAULT_IGNORE_INDEX)?.to_vec1::<f32>()?;
        assert_close(logps[0], 0.5f32.ln());
        Ok(())
    }

    #[rstest]
    fn test_get_batch_logps_rejects_short_sequences() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::zeros((1_usize, 1_usize, 4_usize), DType::F32, &dev)?;
        let labels = Tensor::new(&[[1i64]], &dev)?;
        assert!(get_batch_logps(&logits, &labels, DEFAULT_IGNORE_INDEX).is_err());
        Ok(())
    }

    #[rstest]
    fn test_jpo_loss_at_reference_is_ln2() -> Result<()> {
        let dev = Device::Cpu;
        let logps = Tensor::new(&[-3f32, -7.5], &dev)?;
        let (loss, metrics) = jpo_loss(&logps, &logps, &logps, &logps, 0.1)?;
        assert_close(loss.to_scalar::<f32>()?, 2f32.ln());
        assert_close(metrics.rewards_margin, 0.);
        assert_close(metrics.rewards_accuracy, 0.);
        assert_close(metrics.logps_chosen, -5.25);
        Ok(())
    }

    #[rstest]
    #[case(0.5, 0.313_261_7)]
    #[case(1.0, 0.126_928)]
    fn test_jpo_loss_hand_computed(#[case] beta: f64, #[case] expected: f32) -> Result<()> {
        let dev = Device::Cpu;
        let policy_chosen = Tensor::new(&[-1f32], &dev)?;
        let policy_rejected = Tensor::new(&[-3f32], &dev)?;
        let reference = Tensor::new(&[-2f32], &dev)?;
        // logits = beta * ((-1 + 2) - (-3 + 2)) = 2 * beta
        let (loss, metrics) =
            jpo_loss(&policy_chosen, &policy_rejected, &reference, &reference, beta)?;

        assert_close(loss.to_scalar::<f32>()?, expected);
        assert_close(metrics.rewards_chosen, beta as f32);
        assert_close(metrics.rewards_rejected, -beta as f32);
        assert_close(metrics.rewards_margin, 2. * beta as f32);
        assert_close(metrics.rewards_accuracy, 1.);
        Ok(())
    }

    #[rstest]
    fn test_jpo_loss_is_finite_for_large_margins() -> Result<()> {
        let dev = Device::Cpu;
        let chosen = Tensor::new(&[-1f32, -1000.], &dev)?;
        let rejected = Tensor::new(&[-1000f32, -1.], &dev)?;
        let zeros = Tensor::zeros(2_usize, DType::F32, &dev)?;
        let (loss, _) = jpo_loss(&chosen, &rejected, &zeros, &zeros, 1.0)?;
        let loss = loss.to_scalar::<f32>()?;
        assert!(loss.is_finite());
        // one pair contributes ~0, the other ~999
        assert_close(loss, 999. / 2.);
        Ok(())
    }

    #[rstest]
    fn test_metrics_mean_and_names() {
        let a = JpoMetrics {
            loss: 1.,
            rewards_accuracy: 1.,
            ..Default::default()
        };
        let b = JpoMetrics {
            loss: 3.,
            ..Default::default()
        };
        let mean = JpoMetrics::mean(&[a, b]);
        assert_eq!(mean.loss, 2.);
        assert_eq!(mean.rewards_accuracy, 0.5);

        let map = mean.to_map("eval_");
        assert_eq!(map["eval_loss"], 2.);
        assert!(map.contains_key("eval_rewards/margins"));
        assert_eq!(JpoMetrics::mean(&[]), JpoMetrics::default());
    }
}
