//! Plant output model

use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::domain::{PlantConfig, REFERENCE_IRRADIANCE_W_M2};

/// Weather noise distribution: N(1.0, 0.05) clamped to [0.8, 1.2]
const NOISE_STD_DEV: f64 = 0.05;
const NOISE_MIN: f64 = 0.8;
const NOISE_MAX: f64 = 1.2;

/// Instantaneous AC output in watts.
///
/// `noise` multiplies the irradiance before normalisation; the result is
/// always inside `[0, rated_total_w]` for finite inputs. Returns None when
/// the inputs produce a non-finite value.
pub fn instantaneous_power_w(config: &PlantConfig, irradiance_w_m2: f64, noise: f64) -> Option<f64> {
    let rated_total = config.rated_total_w();
    let fraction = (irradiance_w_m2 * noise / REFERENCE_IRRADIANCE_W_M2).clamp(0.0, 1.0);
    let power = config.panel_count as f64 * config.rated_capacity_per_panel_w * config.derate * fraction;

    if !power.is_finite() || !rated_total.is_finite() {
        return None;
    }
    Some(power.min(rated_total).max(0.0))
}

/// Draw one multiplicative weather noise factor
pub fn weather_noise<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    // std dev is a positive constant so construction cannot fail
    let factor = Normal::new(1.0, NOISE_STD_DEV)
        .map(|normal| normal.sample(rng))
        .unwrap_or(1.0);
    factor.clamp(NOISE_MIN, NOISE_MAX)
}
