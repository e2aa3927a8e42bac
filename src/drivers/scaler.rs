use crate::drivers::calibration::{sanitize_spread_scale, CalibrationResult};

/// Renderable vertical range of the feedback display.
pub const SCREEN_MIN: f64 = -1.0;
pub const SCREEN_MAX: f64 = 1.0;

/// Maps a raw metric to a bounded screen level.
///
/// `(raw - zero_point) / (10 * spread_scale) + zero_screen_pos`, clamped to
/// the screen. A degenerate scale is replaced by the default and a non-finite
/// metric lands on the zero line.
pub fn scale_level(raw: f64, zero_point: f64, spread_scale: f64, zero_screen_pos: f64) -> f64 {
    if !raw.is_finite() {
        return zero_screen_pos.clamp(SCREEN_MIN, SCREEN_MAX);
    }
    let scale = sanitize_spread_scale(spread_scale);
    ((raw - zero_point) / (10.0 * scale) + zero_screen_pos).clamp(SCREEN_MIN, SCREEN_MAX)
}

/// [`scale_level`] bound to one session's calibration.
#[derive(Clone, Copy, Debug)]
pub struct LevelScaler {
    pub zero_point: f64,
    pub spread_scale: f64,
    pub zero_screen_pos: f64,
}
impl LevelScaler {
    pub fn new(calibration: &CalibrationResult, zero_screen_pos: f64) -> Self {
        Self {
            zero_point: calibration.zero_point,
            spread_scale: calibration.spread_scale,
            zero_screen_pos,
        }
    }
    pub fn scale(&self, raw: f64) -> f64 {
        scale_level(raw, self.zero_point, self.spread_scale, self.zero_screen_pos)
    }
}

/// Bar drawn from the zero line towards the current level.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BarGeometry {
    pub center: f64,
    /// Half the bar's height; the bar spans `center ± length`.
    pub length: f64,
}
impl BarGeometry {
    /// The bar never detaches from the zero line: within `min_length` of it
    /// the bar keeps its minimum size centred on the level, further away it
    /// stretches so one end stays anchored.
    pub fn from_level(level: f64, zero_screen_pos: f64, min_length: f64) -> Self {
        let stretched = |distance: f64| distance / 2.0 + min_length / 2.0;
        if level < zero_screen_pos - min_length {
            let length = stretched(zero_screen_pos - level);
            BarGeometry {
                center: zero_screen_pos - length,
                length,
            }
        } else if level > zero_screen_pos + min_length {
            let length = stretched(level - zero_screen_pos);
            BarGeometry {
                center: zero_screen_pos + length,
                length,
            }
        } else {
            BarGeometry {
                center: level,
                length: min_length,
            }
        }
    }
}
