//! # Human-Pattern Scheduling
//!
//! Turns an earliest-eligible instant into either a concrete dispatch time
//! or a skipped cycle, layering calendar-shaped entropy on top: off-days,
//! night lulls, weekend dampening, daypart bias, and a small Bernoulli skip.
//! Everything draws from a per-(wallet, cycle) seeded RNG, so a decision is
//! reproducible for debugging and testing while staying unpredictable
//! across wallets and days.

use crate::config::{JitterDistribution, SchedulingConfig};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

/// Verdict for one (wallet, cycle): dispatch at an instant, or sit this one
/// out entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    At(DateTime<Utc>),
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Faucet,
    Action,
}

pub struct EntropyScheduler {
    config: SchedulingConfig,
}

impl EntropyScheduler {
    pub fn new(config: SchedulingConfig) -> Self {
        Self { config }
    }

    /// Deterministic RNG for one (wallet, cycle) pair.
    pub fn rng_for(wallet: &str, cycle: u64) -> StdRng {
        let mut hasher = Sha256::new();
        hasher.update(wallet.as_bytes());
        hasher.update(cycle.to_le_bytes());
        let digest = hasher.finalize();
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        StdRng::seed_from_u64(u64::from_le_bytes(seed))
    }

    pub fn next_eligible_instant(
        &self,
        wallet: &str,
        base: DateTime<Utc>,
        cycle: u64,
        kind: ScheduleKind,
    ) -> Decision {
        let mut rng = Self::rng_for(wallet, cycle);
        self.decide(base, kind, &mut rng)
    }

    /// Entropy layers, applied in a fixed order: off-days, night lull,
    /// weekend dampening, daypart bias, Bernoulli skip.
    pub fn decide(&self, base: DateTime<Utc>, kind: ScheduleKind, rng: &mut impl Rng) -> Decision {
        let mut t = base;

        // Off-days: push the whole operation to the next working day,
        // entering it at a fresh random time rather than the base instant's.
        let mut pushed = false;
        for _ in 0..7 {
            if !self.config.off_days.contains(&t.weekday().num_days_from_monday()) {
                break;
            }
            t += ChronoDuration::days(1);
            pushed = true;
        }
        if pushed {
            t = self.randomize_time_of_day(t, rng);
        }

        // Night lull: usually shift out of the lull, occasionally proceed
        // anyway so the pattern is not a hard curfew.
        if self.in_night_lull(t.hour() as u8)
            && rng.gen::<f64>() < self.config.night_activity_reduction
        {
            t = self.shift_out_of_lull(t, rng);
        }

        // Weekend dampening: same shift-or-proceed shape as the night lull,
        // pushing the dampened fraction of weekend slots onto a weekday.
        if t.weekday().num_days_from_monday() >= 5
            && rng.gen::<f64>() < self.config.weekend_activity_reduction
        {
            while t.weekday().num_days_from_monday() >= 5 {
                t += ChronoDuration::days(1);
            }
            t = self.randomize_time_of_day(t, rng);
        }

        // Daypart bias: outside every activity window, resample into one.
        if !self.in_daypart(t.hour() as u8) && !self.config.daypart_windows.is_empty() {
            t = self.resample_into_daypart(t, rng);
        }

        // Residual unpredictability even on a perfect slot.
        let skip_prob = match kind {
            ScheduleKind::Faucet => self.config.faucet_skip_probability,
            ScheduleKind::Action => self.config.action_skip_probability,
        };
        if rng.gen::<f64>() < skip_prob {
            return Decision::Skip;
        }

        Decision::At(t)
    }

    fn in_night_lull(&self, hour: u8) -> bool {
        self.config
            .night_lull_windows
            .iter()
            .any(|(start, end)| hour >= *start && hour < *end)
    }

    fn in_daypart(&self, hour: u8) -> bool {
        self.config
            .daypart_windows
            .iter()
            .any(|w| hour >= w.start_hour && hour < w.end_hour)
    }

    /// Fresh random time on the given day: a random hour inside one of the
    /// activity windows when any are configured, otherwise daytime hours.
    fn randomize_time_of_day(&self, t: DateTime<Utc>, rng: &mut impl Rng) -> DateTime<Utc> {
        let hour = if self.config.daypart_windows.is_empty() {
            rng.gen_range(8..22u8)
        } else {
            let idx = rng.gen_range(0..self.config.daypart_windows.len());
            let w = &self.config.daypart_windows[idx];
            rng.gen_range(w.start_hour..w.end_hour)
        };
        let minute = rng.gen_range(0..60);
        t.date_naive()
            .and_hms_opt(u32::from(hour), minute, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(t)
    }

    /// Walk forward hour by hour to the first non-lull hour, then add a
    /// random sub-hour offset.
    fn shift_out_of_lull(&self, mut t: DateTime<Utc>, rng: &mut impl Rng) -> DateTime<Utc> {
        for _ in 0..24 {
            if !self.in_night_lull(t.hour() as u8) {
                break;
            }
            t += ChronoDuration::hours(1);
        }
        t + ChronoDuration::minutes(rng.gen_range(0..45))
    }

    /// Move the instant into a randomly chosen activity window, same day if
    /// the window is still ahead, otherwise the next day.
    fn resample_into_daypart(&self, t: DateTime<Utc>, rng: &mut impl Rng) -> DateTime<Utc> {
        let idx = rng.gen_range(0..self.config.daypart_windows.len());
        let w = &self.config.daypart_windows[idx];
        let hour = rng.gen_range(w.start_hour..w.end_hour);
        let minute = rng.gen_range(0..60);

        let candidate = t
            .date_naive()
            .and_hms_opt(u32::from(hour), minute, 0)
            .map(|naive| naive.and_utc())
            .unwrap_or(t);

        if candidate >= t {
            candidate
        } else {
            candidate + ChronoDuration::days(1)
        }
    }

    /// Delay sampled from `[min_secs, max_secs]` under the configured
    /// distribution. Gaussian uses Box-Muller centered on the midpoint and
    /// clamps back into the bounds.
    pub fn jittered_delay(&self, min_secs: f64, max_secs: f64, rng: &mut impl Rng) -> f64 {
        if max_secs <= min_secs {
            return min_secs;
        }
        match self.config.jitter_distribution {
            JitterDistribution::Uniform => rng.gen_range(min_secs..=max_secs),
            JitterDistribution::Gaussian => {
                let mean = (min_secs + max_secs) / 2.0;
                let sd = (max_secs - min_secs) / 6.0;
                let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
                let u2: f64 = rng.gen_range(0.0..1.0);
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                (mean + z * sd).clamp(min_secs, max_secs)
            }
        }
    }
}
