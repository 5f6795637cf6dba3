//! Low-rank adapters
//!
//! A `LinearWithLoRA` computes `W x + b + (alpha / r) * B A dropout(x)` where
//! `W` and `b` are the frozen pretrained weights and only `A` and `B` are
//! trained. `B` starts at zero, so a freshly attached adapter leaves the
//! model's outputs unchanged.

use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{init, Dropout, Init, Linear, VarBuilder};
use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// Projections inside a transformer block that can carry an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetModule {
    Query,
    Key,
    Value,
    OutProj,
    FfIn,
    FfOut,
}

impl TargetModule {
    pub const ALL: [TargetModule; 6] = [
        Self::Query,
        Self::Key,
        Self::Value,
        Self::OutProj,
        Self::FfIn,
        Self::FfOut,
    ];
}

impl Display for TargetModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Query => "query",
            Self::Key => "key",
            Self::Value => "value",
            Self::OutProj => "out_proj",
            Self::FfIn => "ff_in",
            Self::FfOut => "ff_out",
        };
        write!(f, "{name}")
    }
}

/// Adapter hyperparameters, saved next to the weights as `adapter_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoRAConfig {
    pub r: usize,
    pub lora_alpha: f64,
    pub lora_dropout: f32,
    pub target_modules: Vec<TargetModule>,
    pub base_model_name_or_path: String,
}

impl LoRAConfig {
    pub fn new(r: usize, lora_alpha: f64, lora_dropout: f32) -> Self {
        Self {
            r,
            lora_alpha,
            lora_dropout,
            target_modules: TargetModule::ALL.to_vec(),
            base_model_name_or_path: String::new(),
        }
    }

    pub fn base_model_name_or_path(mut self, name: &str) -> Self {
        self.base_model_name_or_path = name.to_string();
        self
    }

    pub fn target_modules(mut self, target_modules: &[TargetModule]) -> Self {
        self.target_modules = target_modules.to_vec();
        self
    }

    pub fn scaling(&self) -> f64 {
        self.lora_alpha / self.r as f64
    }

    pub fn targets(&self, module: TargetModule) -> bool {
        self.target_modules.contains(&module)
    }
}

/// The trainable `A` (in x r) and `B` (r x out) pair
#[derive(Clone, Debug)]
pub struct LoRALayer {
    a: Tensor,
    b: Tensor,
    scaling: f64,
    dropout: Dropout,
}

impl LoRALayer {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        cfg: &LoRAConfig,
        vb: VarBuilder<'_>,
    ) -> Result<Self> {
        let a = vb.get_with_hints((in_dim, cfg.r), "A", init::DEFAULT_KAIMING_UNIFORM)?;
        let b = vb.get_with_hints((cfg.r, out_dim), "B", Init::Const(0.))?;
        Ok(Self {
            a,
            b,
            scaling: cfg.scaling(),
            dropout: Dropout::new(cfg.lora_dropout),
        })
    }

    pub fn a(&self) -> &Tensor {
        &self.a
    }

    pub fn b(&self) -> &Tensor {
        &self.b
    }
}

impl ModuleT for LoRALayer {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.dropout.forward(xs, train)?;
        xs.broadcast_matmul(&self.a)?
            .broadcast_matmul(&self.b)?
            .affine(self.scaling, 0.)
    }
}

/// A frozen `Linear` with an optional adapter
#[derive(Clone, Debug)]
pub struct LinearWithLoRA {
    linear: Linear,
    lora: Option<LoRALayer>,
}

impl LinearWithLoRA {
    pub fn from_linear(linear: Linear) -> Self {
        Self { linear, lora: None }
    }

    /// Attaches a fresh adapter whose variables are created under `vb`
    pub fn attach_lora(&mut self, cfg: &LoRAConfig, vb: VarBuilder<'_>) -> Result<()> {
        let (out_dim, in_dim) = self.linear.weight().dims2()?;
        self.lora = Some(LoRALayer::new(in_dim, out_dim, cfg, vb)?);
        Ok(())
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.linear.bias()
    }

    pub fn lora(&self) -> Option<&LoRALayer> {
        self.lora.as_ref()
    }
}

impl ModuleT for LinearWithLoRA {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let out = self.linear.forward(xs)?;
        match &self.lora {
            Some(lora) => out + lora.forward_t(xs, train)?,
            None => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use candle_core::{DType, Device};
    use candle_nn::{linear_b, VarMap};
    use rstest::*;

    #[fixture]
    fn lora_config() -> LoRAConfig {
        LoRAConfig::new(4, 8., 0.)
    }

    #[rstest]
    fn test_lora_config_scaling(lora_config: LoRAConfig) {
        assert_eq!(lora_config.scaling(), 2.);
        assert!(lora_config.targets(TargetModule::FfOut));
        let narrowed = lora_config.target_modules(&[TargetModule::Query]);
        assert!(!narrowed.targets(TargetModule::Key));
    }

    #[rstest]
    fn test_lora_layer_init(lora_config: LoRAConfig) -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = LoRALayer::new(6, 3, &lora_config, vb.pp("lora"))?;

        assert_eq!(layer.a().dims(), &[6, 4]);
        assert_eq!(layer.b().dims(), &[4, 3]);
        assert_eq!(layer.b().sum_all()?.to_scalar::<f32>()?, 0.);
        assert_eq!(varmap.all_vars().len(), 2);
        Ok(())
    }

    #[rstest]
    fn test_fresh_adapter_is_identity(lora_config: LoRAConfig) -> Result<()> {
        let dev = Device::Cpu;
        let base_varmap = VarMap::new();
        let base_vb = VarBuilder::from_varmap(&base_varmap, DType::F32, &dev);
        let linear = linear_b(6, 3, true, base_vb.pp("linear"))?;
        let mut adapted = LinearWithLoRA::from_linear(linear.clone());

        let lora_varmap = VarMap::new();
        let lora_vb = VarBuilder::from_varmap(&lora_varmap, DType::F32, &dev);
        adapted.attach_lora(&lora_config, lora_vb.pp("linear"))?;

        let xs = Tensor::rand(0f32, 1f32, (2_usize, 5_usize, 6_usize), &dev)?;
        let expected = linear.forward(&xs)?;
        let actual = adapted.forward_t(&xs, true)?;
        let max_diff = (expected - actual)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(max_diff < 1e-6);
        assert!(adapted.lora().is_some());
        Ok(())
    }
}
