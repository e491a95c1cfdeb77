//! Decoding parameters.

use candle_transformers::generation::Sampling;

/// Fixed decoding settings of the chat loop. One sequence per call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationConfig {
    pub do_sample: bool,
    pub top_k: usize,
    pub top_p: f64,
    pub temperature: f64,
    /// Applied over every token of the sequence, prompt included.
    pub repetition_penalty: f32,
    /// `<eom>`: end of a MOSS turn.
    pub eos_token_id: u32,
    /// Prompt plus continuation, in tokens.
    pub max_length: usize,
}

impl GenerationConfig {
    /// Settings used by the MOSS chat demo.
    pub fn moss() -> Self {
        Self {
            do_sample: true,
            top_k: 40,
            top_p: 0.8,
            temperature: 0.7,
            repetition_penalty: 1.02,
            eos_token_id: 106068,
            max_length: 2048,
        }
    }

    pub fn sampling(&self) -> Sampling {
        if !self.do_sample || self.temperature <= 0.0 {
            return Sampling::ArgMax;
        }
        Sampling::TopKThenTopP {
            k: self.top_k,
            p: self.top_p,
            temperature: self.temperature,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self::moss()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moss_settings() {
        let config = GenerationConfig::default();
        assert_eq!(config.top_k, 40);
        assert_eq!(config.max_length, 2048);
        assert!(matches!(
            config.sampling(),
            Sampling::TopKThenTopP { k: 40, .. }
        ));
    }

    #[test]
    fn greedy_when_sampling_disabled() {
        let config = GenerationConfig {
            do_sample: false,
            ..Default::default()
        };
        assert!(matches!(config.sampling(), Sampling::ArgMax));
    }
}
