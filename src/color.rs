use crate::error::CommandError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// CIE xy chromaticity and brightness for the bridge, using the
    /// wide-gamut D65 conversion Hue documents for its bulbs.
    pub fn to_xy_bri(self) -> ([f32; 2], u8) {
        let lin = |c: u8| {
            let c = c as f32 / 255.0;
            if c > 0.04045 {
                ((c + 0.055) / 1.055).powf(2.4)
            } else {
                c / 12.92
            }
        };
        let (r, g, b) = (lin(self.r), lin(self.g), lin(self.b));

        let x = r * 0.664_511 + g * 0.154_324 + b * 0.162_028;
        let y = r * 0.283_881 + g * 0.668_433 + b * 0.047_685;
        let z = r * 0.000_088 + g * 0.072_310 + b * 0.986_039;
        let sum = x + y + z;
        if sum == 0.0 {
            return ([0.0, 0.0], 0);
        }
        let xy = [round4(x / sum), round4(y / sum)];
        let bri = (y * 254.0).round().clamp(0.0, 254.0) as u8;
        (xy, bri)
    }

    fn lerp(self, other: Rgb, t: f32) -> Rgb {
        let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * t).round() as u8;
        Rgb::new(mix(self.r, other.r), mix(self.g, other.g), mix(self.b, other.b))
    }
}

fn round4(v: f32) -> f32 {
    (v * 10_000.0).round() / 10_000.0
}

/// Parse `#rrggbb` or `#rgb`.
pub fn parse_hex(value: &str) -> Result<Rgb, CommandError> {
    let invalid = |reason| CommandError::InvalidFormat {
        param: "color",
        value: value.to_string(),
        reason,
    };
    let digits = value
        .strip_prefix('#')
        .ok_or_else(|| invalid("expected a leading #"))?;
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("not a hex color"));
    }
    let nibble = |i: usize| u8::from_str_radix(&digits[i..i + 1], 16).unwrap_or_default();
    match digits.len() {
        6 => {
            let byte = |i: usize| u8::from_str_radix(&digits[i..i + 2], 16).unwrap_or_default();
            Ok(Rgb::new(byte(0), byte(2), byte(4)))
        }
        3 => Ok(Rgb::new(nibble(0) * 17, nibble(1) * 17, nibble(2) * 17)),
        _ => Err(invalid("expected #rrggbb or #rgb")),
    }
}

/// Evenly spaced colour stops over `0.0..=1.0`.
#[derive(Debug, Clone)]
pub struct Gradient {
    stops: Vec<Rgb>,
}

impl Gradient {
    pub fn new(stops: Vec<Rgb>) -> Self {
        Self { stops }
    }

    /// Load gradient: cornflower blue through gold and red to white.
    pub fn load() -> Self {
        Self::new(vec![
            Rgb::new(0x64, 0x95, 0xED),
            Rgb::new(0x00, 0xBF, 0xFF),
            Rgb::new(0xFF, 0xD7, 0x00),
            Rgb::new(0xFF, 0x14, 0x93),
            Rgb::new(0xFF, 0x8C, 0x00),
            Rgb::new(0xFF, 0x00, 0x00),
            Rgb::new(0xFF, 0xFF, 0xFF),
        ])
    }

    pub fn at(&self, t: f32) -> Rgb {
        match self.stops.len() {
            0 => Rgb::new(0, 0, 0),
            1 => self.stops[0],
            n => {
                let t = t.clamp(0.0, 1.0) * (n - 1) as f32;
                let i = (t.floor() as usize).min(n - 2);
                self.stops[i].lerp(self.stops[i + 1], t - i as f32)
            }
        }
    }
}
