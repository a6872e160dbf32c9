//! Color palette for CLI rendering.

use colored::{ColoredString, Colorize};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThemeColor(pub u8, pub u8, pub u8);

impl ThemeColor {
    pub fn dim(self, factor: f32) -> Self {
        let scale = |c: u8| (c as f32 * factor) as u8;
        ThemeColor(scale(self.0), scale(self.1), scale(self.2))
    }

    pub fn paint(self, s: &str) -> ColoredString {
        s.truecolor(self.0, self.1, self.2)
    }
}

pub mod theme {
    use super::ThemeColor;

    /// Confirmed branches and successful commits.
    pub const OK: ThemeColor = ThemeColor(142, 192, 124);
    pub const ERROR: ThemeColor = ThemeColor(204, 36, 29);
    /// Timed-out reconciliations: the branch may still appear.
    pub const PENDING: ThemeColor = ThemeColor(250, 189, 47);
    pub const SHA: ThemeColor = ThemeColor(215, 153, 33);
    pub const DIRECTORY: ThemeColor = ThemeColor(131, 165, 152);
    pub const TREE_GUIDE: ThemeColor = ThemeColor(55, 55, 50);
    pub const LABEL: ThemeColor = ThemeColor(128, 128, 128);
    pub const MUTED: ThemeColor = ThemeColor(90, 90, 90);
    pub const PRIVATE: ThemeColor = ThemeColor(180, 142, 173);
}

/// Stable color for a branch or repository name, so the same name looks the
/// same across commands and runs. The hue comes from the name's MD5 digest;
/// saturation and value are fixed for terminal readability.
pub fn name_color(name: &str) -> ThemeColor {
    let hash = md5::compute(name);
    let hue = (u16::from(hash[0]) | (u16::from(hash[1]) << 8)) % 360;
    let (r, g, b) = hsv_to_rgb(hue as f32, 0.35, 0.75);
    ThemeColor(r, g, b)
}

/// h: hue (0-360), s: saturation (0-1), v: value (0-1)
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (u8, u8, u8) {
    let c = v * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = v - c;

    let (r, g, b) = match h as u32 {
        0..60 => (c, x, 0.0),
        60..120 => (x, c, 0.0),
        120..180 => (0.0, c, x),
        180..240 => (0.0, x, c),
        240..300 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    let channel = |value: f32| ((value + m) * 255.0) as u8;
    (channel(r), channel(g), channel(b))
}
