//! Voice quality estimation with the ITU-T G.107 E-model
//!
//! Only the delay impairment `Id` and the effective equipment impairment
//! `Ie-eff` vary; every other term of the model is folded into the default
//! basic signal-to-noise value of 94.2.

use crate::protocol::CodecProfile;
use serde::Serialize;

const R0: f64 = 94.2;
const DELAY_KNEE_MS: f64 = 177.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QualityEstimate {
    pub mos: f64,
    pub r_factor: f64,
    /// Delay impairment
    pub id: f64,
    /// Effective equipment impairment
    pub ie_eff: f64,
}

/// Estimate R-factor and MOS from one-way delay and loss percentage.
///
/// `burst_ratio` is 1.0 for random loss and grows with burstiness. The loss
/// impairment follows ITU-T G.107: `Ie-eff = Ie + (95 - Ie) * Ppl / (Ppl / BurstR + Bpl)`.
pub fn estimate(
    delay_ms: f64,
    loss_percent: f64,
    profile: &CodecProfile,
    burst_ratio: f64,
) -> QualityEstimate {
    let d = delay_ms.max(0.0);
    let ppl = loss_percent.max(0.0);

    let mut id = 0.024 * d;
    if d > DELAY_KNEE_MS {
        id += 0.11 * (d - DELAY_KNEE_MS);
    }

    let ie_eff = if ppl > 0.0 {
        profile.ie + (95.0 - profile.ie) * ppl / (ppl / burst_ratio + profile.bpl)
    } else {
        profile.ie
    };

    let r_factor = R0 - id - ie_eff;

    QualityEstimate {
        mos: mos_from_r(r_factor),
        r_factor,
        id,
        ie_eff,
    }
}

/// G.107 Annex B mapping from R to MOS
pub fn mos_from_r(r: f64) -> f64 {
    if r <= 0.0 {
        1.0
    } else if r >= 100.0 {
        4.5
    } else {
        let mos = 1.0 + 0.035 * r + r * (r - 60.0) * (100.0 - r) * 7e-6;
        mos.clamp(1.0, 4.5)
    }
}
