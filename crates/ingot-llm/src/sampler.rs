//! Sampler parameters and chain composition.
//!
//! The chain is planned as data before any backend sampler is built, so the
//! composition rules are testable without a loaded model. The engine
//! materializes the plan into the backend's sampler chain, prepending a
//! clone of the canonical grammar constraint when one is active.

use serde::{Deserialize, Serialize};

/// Sampling parameters, cached between turns so the chain can be rebuilt
/// verbatim each round.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    /// Top-k cutoff.
    pub top_k: i32,
    /// Nucleus sampling cutoff; values >= 1.0 disable the stage.
    pub top_p: f32,
    /// Temperature; 0 selects greedy decoding.
    pub temperature: f32,
    /// Min-p cutoff; values <= 0.0 disable the stage.
    pub min_p: f32,
    /// Mirostat mode; any value > 0 replaces the standard stages.
    pub mirostat: i32,
    /// Mirostat target entropy.
    pub mirostat_tau: f32,
    /// Mirostat learning rate.
    pub mirostat_eta: f32,
    /// Seed for the distribution sampler.
    pub seed: u32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            temperature: 0.7,
            min_p: 0.05,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            seed: 42,
        }
    }
}

/// One stage of a planned sampler chain, in application order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplerStage {
    /// Clone of the canonical grammar constraint. Always first so later
    /// stages see already-masked logits.
    Grammar,
    /// Mirostat terminates the chain on its own.
    Mirostat {
        /// Target entropy.
        tau: f32,
        /// Learning rate.
        eta: f32,
        /// Seed.
        seed: u32,
    },
    /// Temperature scaling.
    Temp(f32),
    /// Top-k filter.
    TopK(i32),
    /// Top-p filter.
    TopP(f32),
    /// Min-p filter.
    MinP(f32),
    /// Seeded distribution sampler.
    Dist(u32),
    /// Greedy argmax (temperature 0).
    Greedy,
}

/// Plan the sampler chain for one generation turn.
///
/// Ordering and skip rules:
/// 1. grammar clone first, when a constraint is active;
/// 2. mirostat > 0 replaces every standard stage;
/// 3. temperature applies only when > 0 and not within 1e-3 of 1.0;
/// 4. top-k always; top-p skipped when >= 1; min-p skipped when <= 0;
/// 5. seeded dist when temperature > 0, greedy otherwise.
pub fn plan_chain(params: &SamplerParams, with_grammar: bool) -> Vec<SamplerStage> {
    let mut stages = Vec::with_capacity(6);

    if with_grammar {
        stages.push(SamplerStage::Grammar);
    }

    if params.mirostat > 0 {
        stages.push(SamplerStage::Mirostat {
            tau: params.mirostat_tau,
            eta: params.mirostat_eta,
            seed: params.seed,
        });
        return stages;
    }

    if params.temperature > 0.0 && (params.temperature - 1.0).abs() > 1e-3 {
        stages.push(SamplerStage::Temp(params.temperature));
    }

    stages.push(SamplerStage::TopK(params.top_k));

    if params.top_p < 1.0 {
        stages.push(SamplerStage::TopP(params.top_p));
    }
    if params.min_p > 0.0 {
        stages.push(SamplerStage::MinP(params.min_p));
    }

    if params.temperature > 0.0 {
        stages.push(SamplerStage::Dist(params.seed));
    } else {
        stages.push(SamplerStage::Greedy);
    }

    stages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_params_standard_chain() {
        let stages = plan_chain(&SamplerParams::default(), false);
        assert_eq!(
            stages,
            vec![
                SamplerStage::Temp(0.7),
                SamplerStage::TopK(40),
                SamplerStage::TopP(0.9),
                SamplerStage::MinP(0.05),
                SamplerStage::Dist(42),
            ]
        );
    }

    #[test]
    fn grammar_stage_comes_first() {
        let stages = plan_chain(&SamplerParams::default(), true);
        assert_eq!(stages[0], SamplerStage::Grammar);
        assert_eq!(stages.len(), 6);
    }

    #[test]
    fn mirostat_short_circuits_standard_stages() {
        let params = SamplerParams {
            mirostat: 2,
            ..SamplerParams::default()
        };
        let stages = plan_chain(&params, true);
        assert_eq!(
            stages,
            vec![
                SamplerStage::Grammar,
                SamplerStage::Mirostat {
                    tau: 5.0,
                    eta: 0.1,
                    seed: 42
                },
            ]
        );
    }

    #[test]
    fn temperature_near_one_is_skipped() {
        let params = SamplerParams {
            temperature: 1.0005,
            ..SamplerParams::default()
        };
        let stages = plan_chain(&params, false);
        assert!(!stages.iter().any(|s| matches!(s, SamplerStage::Temp(_))));
        assert!(stages.iter().any(|s| matches!(s, SamplerStage::Dist(_))));
    }

    #[test]
    fn zero_temperature_selects_greedy() {
        let params = SamplerParams {
            temperature: 0.0,
            ..SamplerParams::default()
        };
        let stages = plan_chain(&params, false);
        assert_eq!(stages.last(), Some(&SamplerStage::Greedy));
        assert!(!stages.iter().any(|s| matches!(s, SamplerStage::Dist(_))));
        assert!(!stages.iter().any(|s| matches!(s, SamplerStage::Temp(_))));
    }

    #[test]
    fn saturated_top_p_and_zero_min_p_are_skipped() {
        let params = SamplerParams {
            top_p: 1.0,
            min_p: 0.0,
            ..SamplerParams::default()
        };
        let stages = plan_chain(&params, false);
        assert!(!stages.iter().any(|s| matches!(s, SamplerStage::TopP(_))));
        assert!(!stages.iter().any(|s| matches!(s, SamplerStage::MinP(_))));
        assert!(stages.iter().any(|s| matches!(s, SamplerStage::TopK(_))));
    }
}
