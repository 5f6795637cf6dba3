//! Joint Preference Optimization fine-tuning of GPT-2 style causal LMs
//!
//! A run flows `config` → `model` (pretrained weights plus LoRA adapters) →
//! `data` (mapping, tokenization, filtering) → `jpo` (trainer) → adapter
//! checkpoints on disk.

pub mod config;
pub mod data;
pub mod jpo;
pub mod model;
pub mod report;
pub mod scheduler;
