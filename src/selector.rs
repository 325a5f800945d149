//! Model plan selection.
//!
//! Maps a [`SystemProfile`](crate::profile::SystemProfile) and a
//! [`CostPreference`] to a [`ModelPlan`] using a configurable tier table.
//! Selection is pure and total: identical inputs always produce an
//! identical plan, with no I/O and no randomness.

use crate::profile::SystemProfile;
use bon::Builder;
use serde::{Deserialize, Serialize};

/// How much the caller is willing to spend on quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostPreference {
    /// Never occupy a GPU; smallest CPU plan.
    FreeOnly,
    /// Use the GPU but leave headroom: capped below the premium tier.
    #[default]
    Balanced,
    /// Largest model and longest context the hardware supports.
    QualityFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Gpu,
}

/// The configuration a server is launched with. Immutable once chosen
/// for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
pub struct ModelPlan {
    pub model_id: String,
    pub max_context_tokens: u32,
    pub device: Device,
    pub tensor_parallel_size: usize,
    pub quantization: Option<String>,
    pub gpu_memory_fraction: Option<f32>,
}

impl ModelPlan {
    /// Command-line arguments for the external serving process, in the
    /// `vllm serve` shape.
    pub(crate) fn serve_args(&self, host: &str, port: u16) -> Vec<String> {
        let mut args = vec![
            "serve".to_string(),
            self.model_id.clone(),
            "--host".to_string(),
            host.to_string(),
            "--port".to_string(),
            port.to_string(),
            "--max-model-len".to_string(),
            self.max_context_tokens.to_string(),
            "--trust-remote-code".to_string(),
        ];

        match self.device {
            Device::Cpu => {
                args.push("--device".to_string());
                args.push("cpu".to_string());
            }
            Device::Gpu => {
                args.push("--tensor-parallel-size".to_string());
                args.push(self.tensor_parallel_size.to_string());
                if let Some(fraction) = self.gpu_memory_fraction {
                    args.push("--gpu-memory-utilization".to_string());
                    args.push(fraction.to_string());
                }
            }
        }

        if let Some(ref quantization) = self.quantization {
            args.push("--quantization".to_string());
            args.push(quantization.clone());
        }

        args
    }
}

/// One GPU capability tier. Tiers are kept sorted by descending
/// `min_gpu_memory_gb`; the tight-margin tiers carry a quantization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuTier {
    pub min_gpu_memory_gb: u64,
    pub model_id: String,
    pub max_context_tokens: u32,
    #[serde(default)]
    pub quantization: Option<String>,
    pub gpu_memory_fraction: f32,
}

/// The CPU plan used for `free_only` and GPU-less hosts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuTier {
    pub model_id: String,
    pub max_context_tokens: u32,
    /// Attached when RAM is below `quantize_below_ram_gb`.
    #[serde(default)]
    pub quantization: Option<String>,
    pub quantize_below_ram_gb: u64,
}

/// The full selection table. Defaults mirror the DeepSeek R1 distill
/// ladder sized for common consumer GPUs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierPolicy {
    pub gpu_tiers: Vec<GpuTier>,
    pub cpu_tier: CpuTier,
    /// Hard cap on context length for CPU plans.
    pub cpu_context_cap: u32,
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self {
            gpu_tiers: vec![
                GpuTier {
                    min_gpu_memory_gb: 24,
                    model_id: "deepseek-ai/DeepSeek-R1-Distill-Qwen-32B".to_string(),
                    max_context_tokens: 32768,
                    quantization: None,
                    gpu_memory_fraction: 0.8,
                },
                GpuTier {
                    min_gpu_memory_gb: 16,
                    model_id: "deepseek-ai/DeepSeek-R1-Distill-Qwen-14B".to_string(),
                    max_context_tokens: 16384,
                    quantization: None,
                    gpu_memory_fraction: 0.8,
                },
                GpuTier {
                    min_gpu_memory_gb: 8,
                    model_id: "deepseek-ai/DeepSeek-R1-Distill-Qwen-7B".to_string(),
                    max_context_tokens: 8192,
                    quantization: Some("awq".to_string()),
                    gpu_memory_fraction: 0.7,
                },
            ],
            cpu_tier: CpuTier {
                model_id: "deepseek-ai/DeepSeek-R1-Distill-Qwen-1.5B".to_string(),
                max_context_tokens: 4096,
                quantization: Some("gptq".to_string()),
                quantize_below_ram_gb: 16,
            },
            cpu_context_cap: 4096,
        }
    }
}

const MAX_TENSOR_PARALLEL: usize = 8;

/// Choose the plan for a host.
///
/// `free_only` and GPU-less hosts get the CPU plan. Otherwise the largest
/// device picks a tier from the table: `quality_first` takes the highest
/// tier it crosses, `balanced` steps one tier down when more than one
/// matches. A GPU too small for every tier falls through to CPU.
pub fn select(profile: &SystemProfile, pref: CostPreference, policy: &TierPolicy) -> ModelPlan {
    if pref == CostPreference::FreeOnly || !profile.gpu_available {
        return cpu_plan(profile, policy);
    }

    let max_vram = profile.max_gpu_memory_gb();
    let matching: Vec<&GpuTier> = policy
        .gpu_tiers
        .iter()
        .filter(|tier| max_vram >= tier.min_gpu_memory_gb)
        .collect();

    let tier = match pref {
        CostPreference::QualityFirst => matching.first().copied(),
        CostPreference::Balanced => matching.get(1).or_else(|| matching.first()).copied(),
        CostPreference::FreeOnly => unreachable!("handled above"),
    };

    match tier {
        Some(tier) => ModelPlan {
            model_id: tier.model_id.clone(),
            max_context_tokens: tier.max_context_tokens,
            device: Device::Gpu,
            tensor_parallel_size: profile.gpu_count.clamp(1, MAX_TENSOR_PARALLEL),
            quantization: tier.quantization.clone(),
            gpu_memory_fraction: Some(tier.gpu_memory_fraction),
        },
        None => cpu_plan(profile, policy),
    }
}

fn cpu_plan(profile: &SystemProfile, policy: &TierPolicy) -> ModelPlan {
    let tier = &policy.cpu_tier;
    let quantization = if profile.total_ram_gb < tier.quantize_below_ram_gb {
        tier.quantization.clone()
    } else {
        None
    };

    ModelPlan {
        model_id: tier.model_id.clone(),
        max_context_tokens: tier.max_context_tokens.min(policy.cpu_context_cap),
        device: Device::Cpu,
        tensor_parallel_size: 1,
        quantization,
        gpu_memory_fraction: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_profile(ram_gb: u64) -> SystemProfile {
        SystemProfile {
            gpu_available: false,
            gpu_count: 0,
            gpu_memory_gb: Vec::new(),
            cpu_cores: 8,
            total_ram_gb: ram_gb,
        }
    }

    fn gpu_profile(vram_gb: Vec<u64>) -> SystemProfile {
        SystemProfile {
            gpu_available: true,
            gpu_count: vram_gb.len(),
            gpu_memory_gb: vram_gb,
            cpu_cores: 16,
            total_ram_gb: 64,
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let policy = TierPolicy::default();
        let profile = gpu_profile(vec![24]);
        let first = select(&profile, CostPreference::QualityFirst, &policy);
        let second = select(&profile, CostPreference::QualityFirst, &policy);
        assert_eq!(first, second);
    }

    #[test]
    fn free_only_gets_smallest_cpu_plan() {
        let policy = TierPolicy::default();
        let plan = select(&cpu_profile(16), CostPreference::FreeOnly, &policy);
        assert_eq!(plan.device, Device::Cpu);
        assert_eq!(plan.model_id, "deepseek-ai/DeepSeek-R1-Distill-Qwen-1.5B");
        assert!(plan.max_context_tokens <= 4096);
        assert_eq!(plan.tensor_parallel_size, 1);
    }

    #[test]
    fn free_only_ignores_available_gpus() {
        let policy = TierPolicy::default();
        let plan = select(&gpu_profile(vec![24]), CostPreference::FreeOnly, &policy);
        assert_eq!(plan.device, Device::Cpu);
    }

    #[test]
    fn no_gpu_falls_back_to_cpu_regardless_of_preference() {
        let policy = TierPolicy::default();
        let plan = select(&cpu_profile(32), CostPreference::QualityFirst, &policy);
        assert_eq!(plan.device, Device::Cpu);
        assert!(plan.max_context_tokens <= 4096);
    }

    #[test]
    fn quality_first_on_24gb_takes_top_tier_unquantized() {
        let policy = TierPolicy::default();
        let plan = select(&gpu_profile(vec![24]), CostPreference::QualityFirst, &policy);
        assert_eq!(plan.model_id, "deepseek-ai/DeepSeek-R1-Distill-Qwen-32B");
        assert_eq!(plan.max_context_tokens, 32768);
        assert_eq!(plan.quantization, None);
        assert_eq!(plan.device, Device::Gpu);
    }

    #[test]
    fn balanced_on_24gb_steps_down_one_tier() {
        let policy = TierPolicy::default();
        let plan = select(&gpu_profile(vec![24]), CostPreference::Balanced, &policy);
        assert_eq!(plan.model_id, "deepseek-ai/DeepSeek-R1-Distill-Qwen-14B");
    }

    #[test]
    fn balanced_on_8gb_has_single_matching_tier() {
        let policy = TierPolicy::default();
        let plan = select(&gpu_profile(vec![8]), CostPreference::Balanced, &policy);
        assert_eq!(plan.model_id, "deepseek-ai/DeepSeek-R1-Distill-Qwen-7B");
        assert_eq!(plan.quantization, Some("awq".to_string()));
    }

    #[test]
    fn gpu_below_every_tier_falls_through_to_cpu() {
        let policy = TierPolicy::default();
        let plan = select(&gpu_profile(vec![4]), CostPreference::QualityFirst, &policy);
        assert_eq!(plan.device, Device::Cpu);
    }

    #[test]
    fn tensor_parallelism_uses_all_devices_up_to_cap() {
        let policy = TierPolicy::default();
        let plan = select(&gpu_profile(vec![24, 24]), CostPreference::QualityFirst, &policy);
        assert_eq!(plan.tensor_parallel_size, 2);

        let many = gpu_profile(vec![24; 16]);
        let plan = select(&many, CostPreference::QualityFirst, &policy);
        assert_eq!(plan.tensor_parallel_size, 8);
    }

    #[test]
    fn low_ram_cpu_plan_is_quantized() {
        let policy = TierPolicy::default();
        let plan = select(&cpu_profile(8), CostPreference::FreeOnly, &policy);
        assert_eq!(plan.quantization, Some("gptq".to_string()));

        let plan = select(&cpu_profile(32), CostPreference::FreeOnly, &policy);
        assert_eq!(plan.quantization, None);
    }

    #[test]
    fn serve_args_for_gpu_plan() {
        let plan = ModelPlan::builder()
            .model_id("some/model".to_string())
            .max_context_tokens(16384)
            .device(Device::Gpu)
            .tensor_parallel_size(2)
            .quantization("awq".to_string())
            .gpu_memory_fraction(0.8)
            .build();
        let args = plan.serve_args("127.0.0.1", 8000);
        assert_eq!(args[0], "serve");
        assert_eq!(args[1], "some/model");
        assert!(args.contains(&"--tensor-parallel-size".to_string()));
        assert!(args.contains(&"--quantization".to_string()));
        assert!(args.contains(&"awq".to_string()));
        assert!(!args.contains(&"--device".to_string()));
    }

    #[test]
    fn serve_args_for_cpu_plan() {
        let plan = ModelPlan::builder()
            .model_id("some/model".to_string())
            .max_context_tokens(4096)
            .device(Device::Cpu)
            .tensor_parallel_size(1)
            .build();
        let args = plan.serve_args("127.0.0.1", 8000);
        assert!(args.contains(&"--device".to_string()));
        assert!(args.contains(&"cpu".to_string()));
        assert!(!args.contains(&"--gpu-memory-utilization".to_string()));
    }
}
