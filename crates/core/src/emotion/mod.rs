use serde::{Deserialize, Serialize};

/// Lower bound applied to `neutral` so a state is never the zero vector.
pub const NEUTRAL_FLOOR: f32 = 0.1;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("{field} is not finite")]
    NotFinite { field: &'static str },

    #[error("{field} = {value} is outside [0, 1]")]
    OutOfRange { field: &'static str, value: f32 },
}

/// Clamp into `[0, 1]`, mapping NaN to 0.
pub fn unit(value: f32) -> f32 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 1.0)
}

pub(crate) fn check_unit(field: &'static str, value: f32) -> Result<(), ShapeError> {
    if !value.is_finite() {
        return Err(ShapeError::NotFinite { field });
    }
    if !(0.0..=1.0).contains(&value) {
        return Err(ShapeError::OutOfRange { field, value });
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct EmotionalState {
    pub joy: f32,
    pub sadness: f32,
    pub anger: f32,
    pub fear: f32,
    pub surprise: f32,
    pub neutral: f32,
}

impl EmotionalState {
    /// Build a state from the five scored components; each is clamped and
    /// `neutral` is derived as `max(0.1, 1 - sum)`.
    pub fn from_components(joy: f32, sadness: f32, anger: f32, fear: f32, surprise: f32) -> Self {
        let joy = unit(joy);
        let sadness = unit(sadness);
        let anger = unit(anger);
        let fear = unit(fear);
        let surprise = unit(surprise);
        let others = joy + sadness + anger + fear + surprise;
        Self {
            joy,
            sadness,
            anger,
            fear,
            surprise,
            neutral: unit((1.0 - others).max(NEUTRAL_FLOOR)),
        }
    }

    /// Fully neutral state used whenever nothing can be inferred.
    pub const fn neutral() -> Self {
        Self {
            joy: 0.0,
            sadness: 0.0,
            anger: 0.0,
            fear: 0.0,
            surprise: 0.0,
            neutral: 1.0,
        }
    }

    pub fn components(&self) -> [(&'static str, f32); 6] {
        [
            ("joy", self.joy),
            ("sadness", self.sadness),
            ("anger", self.anger),
            ("fear", self.fear),
            ("surprise", self.surprise),
            ("neutral", self.neutral),
        ]
    }

    /// Name of the strongest component; ties resolve in declaration order.
    pub fn dominant(&self) -> &'static str {
        let mut best = ("neutral", f32::MIN);
        for (name, value) in self.components() {
            if value > best.1 {
                best = (name, value);
            }
        }
        best.0
    }

    pub fn validate(&self) -> Result<(), ShapeError> {
        for (name, value) in self.components() {
            check_unit(name, value)?;
        }
        Ok(())
    }
}
