//! Rate control — adapts the offer period from accept and ack feedback.
//!
//! Two signals drive it:
//!   acceptance ratio  EWMA of "was anything accepted" per answered offer
//!   ack latency       accept→ack delay of the most recent delivery
//!
//! While faster than the initial period the controller keeps speeding up
//! only if peers accept and acks are quick, otherwise it decays back. While
//! at or slower than the initial period it slows further on high latency
//! and recovers otherwise. Every result is clamped to [period_min, period_max].

use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcast_core::config::RateControlConfig;

use crate::telemetry::Telemetry;

#[derive(Debug, Clone)]
pub struct RateControlParams {
    pub autotune: bool,
    pub smoothing: f64,
    pub min_accept_ratio: f64,
    pub max_ack_latency: Duration,
    pub rate_up: f64,
    pub rate_down: f64,
    pub period_min: Duration,
    pub period_max: Duration,
}

impl From<&RateControlConfig> for RateControlParams {
    fn from(c: &RateControlConfig) -> Self {
        Self {
            autotune: c.autotune,
            smoothing: c.smoothing,
            min_accept_ratio: c.min_accept_ratio,
            max_ack_latency: Duration::from_millis(c.max_ack_latency_ms),
            rate_up: c.rate_up,
            rate_down: c.rate_down,
            period_min: Duration::from_micros(c.period_min_us),
            period_max: Duration::from_micros(c.period_max_us),
        }
    }
}

impl Default for RateControlParams {
    fn default() -> Self {
        Self::from(&RateControlConfig::default())
    }
}

pub struct RateController {
    params: RateControlParams,
    period: Duration,
    initial_period: Duration,
    accept_ratio: f64,
    ack_latency: Duration,
    last_update: Option<Instant>,
    telemetry: Arc<dyn Telemetry>,
}

impl RateController {
    pub fn new(params: RateControlParams, initial_period: Duration, telemetry: Arc<dyn Telemetry>) -> Self {
        let period = initial_period.clamp(params.period_min, params.period_max);
        Self {
            params,
            period,
            initial_period: period,
            accept_ratio: 1.0,
            ack_latency: Duration::ZERO,
            last_update: None,
            telemetry,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn accept_ratio(&self) -> f64 {
        self.accept_ratio
    }

    pub fn ack_latency(&self) -> Duration {
        self.ack_latency
    }

    /// An accept arrived; `accepted` is true if it named at least one chunk.
    pub fn on_accept(&mut self, accepted: bool) {
        let s = self.params.smoothing;
        self.accept_ratio = self.accept_ratio * s + if accepted { 1.0 - s } else { 0.0 };
    }

    /// An ack closed a delivery `latency` after its accept.
    pub fn on_ack(&mut self, latency: Duration, now: Instant) {
        self.telemetry.queue_delay(latency);
        self.ack_latency = latency;
        if self.params.autotune {
            self.update_period(now);
        }
    }

    fn update_period(&mut self, now: Instant) {
        let p = &self.params;
        let dt = match self.last_update {
            Some(last) => now.saturating_duration_since(last).min(p.period_max),
            None => self.period,
        };
        self.last_update = Some(now);
        let dt = dt.as_secs_f64();

        let period = self.period.as_micros() as f64;
        let min = p.period_min.as_micros() as f64;
        let max = p.period_max.as_micros() as f64;
        let max_latency = p.max_ack_latency.as_secs_f64().max(f64::EPSILON);

        let d_ratio = self.accept_ratio - p.min_accept_ratio;
        let d_latency = (self.ack_latency.as_secs_f64() - max_latency) / max_latency;
        let d_period = period.ln() - (self.initial_period.as_micros() as f64).ln();

        let next = if d_period < 0.0 {
            if d_ratio > 0.0 && d_latency < 0.0 {
                // healthy, go faster
                (period / (1.0 + p.rate_down * dt)).max(min)
            } else {
                // drift back towards the initial period
                (period * (1.0 + p.rate_up * (1.0 + d_period.abs()) * dt)).min(max)
            }
        } else if d_latency > 0.0 {
            (period * (1.0 + p.rate_up * dt)).min(max)
        } else {
            (period / (1.0 + p.rate_down * (1.0 + d_period) * dt)).max(min)
        };

        self.set_period(Duration::from_micros(next as u64));
    }

    fn set_period(&mut self, period: Duration) {
        self.period = period;
        self.telemetry.period(period);
        tracing::trace!(
            period_us = period.as_micros() as u64,
            accept_ratio = self.accept_ratio,
            ack_latency_ms = self.ack_latency.as_millis() as u64,
            "offer period updated"
        );
    }
}
