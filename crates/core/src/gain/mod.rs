/// What to do with a song's stems once its loudness is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainAction {
    /// Re-encode every stem with the correction applied.
    Export,
    /// Already close enough: copy the stems byte for byte.
    Copy,
}

/// Outcome of comparing a measured level with the target.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainDecision {
    pub gain_db: f64,
    pub action: GainAction,
}

/// Decides between re-encoding and copying.
///
/// Re-encoding happens only when the correction is strictly larger than
/// `headroom_db`. Silence (`-inf`) always asks for an export.
pub fn decide(measured_dbfs: f64, target_dbfs: f64, headroom_db: f64) -> GainDecision {
    let gain_db = target_dbfs - measured_dbfs;
    let action = if gain_db.abs() > headroom_db {
        GainAction::Export
    } else {
        GainAction::Copy
    };
    GainDecision { gain_db, action }
}
