//! Per-call generation counters (spec §3 "Generation Stats", §6 "Generate
//! output").

use std::time::{Duration, Instant};

#[derive(Clone, Debug, Default)]
pub struct GenerationStats {
    pub prefill_time_ms: f64,
    pub decode_time_ms: f64,
    pub total_time_ms: f64,
    pub tokens_generated: u32,
    /// Time-to-first-token: wall clock from call start to the first yielded
    /// token (prefill plus sampling the seed token).
    pub ttft_ms: f64,
    /// Populated only when `GenerateOptions::profile` is set and the
    /// recorder's timestamp queries resolved (spec §5 "Profiling").
    pub gpu_time_ms: Option<f64>,
}

/// Wall-clock accumulator for one generation call. Not `Clone` — exactly one
/// call owns it, mirroring `Generator::is_generating`'s one-call-at-a-time
/// invariant.
pub(crate) struct StatsTimer {
    call_start: Instant,
    prefill: Duration,
    decode: Duration,
    first_token_at: Option<Instant>,
}

impl StatsTimer {
    pub fn start() -> Self {
        Self {
            call_start: Instant::now(),
            prefill: Duration::ZERO,
            decode: Duration::ZERO,
            first_token_at: None,
        }
    }

    pub fn record_prefill(&mut self, elapsed: Duration) {
        self.prefill += elapsed;
    }

    pub fn record_decode(&mut self, elapsed: Duration) {
        self.decode += elapsed;
    }

    pub fn mark_first_token(&mut self) {
        self.first_token_at.get_or_insert_with(Instant::now);
    }

    pub fn finish(self, tokens_generated: u32, gpu_time_ms: Option<f64>) -> GenerationStats {
        let ttft_ms = self
            .first_token_at
            .map(|t| (t - self.call_start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        GenerationStats {
            prefill_time_ms: self.prefill.as_secs_f64() * 1000.0,
            decode_time_ms: self.decode.as_secs_f64() * 1000.0,
            total_time_ms: self.call_start.elapsed().as_secs_f64() * 1000.0,
            tokens_generated,
            ttft_ms,
            gpu_time_ms,
        }
    }
}
