//! # Cent Meter
//!
//! Text rendition of a tuning meter: a needle on a -50..+50 cent scale plus
//! an accuracy zone label.

/// Maximum cent deviation shown; the meter spans -50 to +50 cents.
const METER_RANGE: f32 = 50.0;

/// Characters on each side of the center mark.
const HALF_WIDTH: usize = 20;

/// Accuracy zones of the meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    InTune,
    Close,
    Off,
}

impl Zone {
    pub fn from_cents(cents: f32) -> Self {
        if cents.abs() < 5.0 {
            Zone::InTune
        } else if cents.abs() < 20.0 {
            Zone::Close
        } else {
            Zone::Off
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Zone::InTune => "ok",
            Zone::Close => "close",
            Zone::Off => "off",
        }
    }
}

/// Renders the scale with the needle at `cents`, e.g. `----+----|---`.
pub fn render(cents: f32) -> String {
    let clamped = cents.clamp(-METER_RANGE, METER_RANGE);
    let needle = ((clamped / METER_RANGE) * HALF_WIDTH as f32).round() as i64 + HALF_WIDTH as i64;
    (0..=2 * HALF_WIDTH as i64)
        .map(|i| {
            if i == needle {
                '|'
            } else if i == HALF_WIDTH as i64 {
                '+'
            } else {
                '-'
            }
        })
        .collect()
}
