use crate::color::{parse_hex, Rgb};
use crate::error::CommandError;
use crate::model::{LightState, StateUpdate};

/// Brightness change for `dim` and `brighten`.
pub const BRIGHTNESS_STEP: u8 = 5;

pub const HUE_RANGE: (i64, i64) = (0, 65535);
pub const SATURATION_RANGE: (i64, i64) = (0, 255);
pub const BRIGHTNESS_RANGE: (i64, i64) = (0, 255);
/// Colour temperature in mireds.
pub const TEMPERATURE_RANGE: (i64, i64) = (153, 500);

/// One queued change against a target.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    On,
    Off,
    Alert,
    Brightness(u8),
    Dim,
    Brighten,
    Hue(u16),
    Saturation(u8),
    Temperature(u16),
    Color(Rgb),
    Effect(String),
    Scene(String),
}

impl Action {
    /// Used in "failed to <verb>" errors.
    pub fn verb(&self) -> &'static str {
        match self {
            Action::On => "turn on",
            Action::Off => "turn off",
            Action::Alert => "alert",
            Action::Brightness(_) => "set brightness",
            Action::Dim => "dim",
            Action::Brighten => "brighten",
            Action::Hue(_) => "set hue",
            Action::Saturation(_) => "set saturation",
            Action::Temperature(_) => "set temperature",
            Action::Color(_) => "set color",
            Action::Effect(_) => "set effect",
            Action::Scene(_) => "set scene",
        }
    }

    /// State change for everything except scene recall. Relative actions
    /// need the target's current state.
    pub fn update(&self, current: Option<&LightState>, label: &str) -> Result<StateUpdate, CommandError> {
        let mut update = StateUpdate::default();
        match self {
            Action::On => update.on = Some(true),
            Action::Off => update.on = Some(false),
            Action::Alert => update.alert = Some("select".to_string()),
            Action::Brightness(bri) => update.bri = Some(*bri),
            Action::Dim | Action::Brighten => {
                let state = current.ok_or_else(|| CommandError::NoStateFound(label.to_string()))?;
                update.bri = Some(if *self == Action::Dim {
                    state.bri.saturating_sub(BRIGHTNESS_STEP)
                } else {
                    state.bri.saturating_add(BRIGHTNESS_STEP)
                });
            }
            Action::Hue(hue) => update.hue = Some(*hue),
            Action::Saturation(sat) => update.sat = Some(*sat),
            Action::Temperature(ct) => update.ct = Some(*ct),
            Action::Color(rgb) => {
                let (xy, bri) = rgb.to_xy_bri();
                update.xy = Some(xy);
                update.bri = Some(bri);
            }
            Action::Effect(effect) => update.effect = Some(effect.clone()),
            Action::Scene(scene) => update.scene = Some(scene.clone()),
        }
        Ok(update)
    }
}

/// Parse an integer parameter and check it against an inclusive range.
pub fn parse_ranged(param: &'static str, value: &str, (min, max): (i64, i64)) -> Result<i64, CommandError> {
    let n = match value.parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            let digits = value.strip_prefix('-').unwrap_or(value);
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
                return Err(CommandError::NotANumber {
                    param,
                    value: value.to_string(),
                });
            }
            if value.starts_with('-') {
                i64::MIN
            } else {
                i64::MAX
            }
        }
    };
    if n < min || n > max {
        return Err(CommandError::OutOfRange {
            param,
            value: n,
            min,
            max,
        });
    }
    Ok(n)
}

pub fn hue(value: &str) -> Result<Action, CommandError> {
    parse_ranged("hue", value, HUE_RANGE).map(|n| Action::Hue(n as u16))
}

pub fn saturation(value: &str) -> Result<Action, CommandError> {
    parse_ranged("saturation", value, SATURATION_RANGE).map(|n| Action::Saturation(n as u8))
}

pub fn brightness(value: &str) -> Result<Action, CommandError> {
    parse_ranged("brightness", value, BRIGHTNESS_RANGE).map(|n| Action::Brightness(n as u8))
}

pub fn temperature(value: &str) -> Result<Action, CommandError> {
    parse_ranged("temperature", value, TEMPERATURE_RANGE).map(|n| Action::Temperature(n as u16))
}

pub fn color(value: &str) -> Result<Action, CommandError> {
    parse_hex(value).map(Action::Color)
}
