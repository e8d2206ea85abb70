//! Participant identity and cursor colors.
//!
//! An [`Identity`] is supplied by the caller and is never mutated once a
//! session holds it. Each attach draws a fresh cursor color into the
//! session's copy, so every broadcast from the same session carries the same
//! hue while separate attaches differ.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// HSL color used for a participant's caret and avatar.
///
/// Serialized as a CSS `hsl(h, s%, l%)` string so browser peers can use the
/// value directly.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct CursorColor {
    /// Hue in degrees, `[0, 360)`.
    pub hue: f32,
    /// Saturation, `[0, 1]`.
    pub saturation: f32,
    /// Lightness, `[0, 1]`.
    pub lightness: f32,
}

impl CursorColor {
    pub const SATURATION: f32 = 0.7;
    pub const LIGHTNESS: f32 = 0.6;

    /// Color with the given hue and the default vivid saturation/lightness.
    pub fn from_hue(hue: f32) -> Self {
        Self {
            hue: hue.rem_euclid(360.0),
            saturation: Self::SATURATION,
            lightness: Self::LIGHTNESS,
        }
    }

    /// Stable color derived from a UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self::from_hue((id.as_u128() % 360) as f32)
    }

    /// Fresh random hue, drawn once per attach.
    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    /// CSS representation, e.g. `hsl(210, 70%, 60%)`.
    pub fn to_css(&self) -> String {
        format!(
            "hsl({}, {}%, {}%)",
            self.hue.round(),
            (self.saturation * 100.0).round(),
            (self.lightness * 100.0).round()
        )
    }

    /// RGBA components in `[0, 1]` for renderers that do not speak CSS.
    pub fn to_rgba(&self) -> [f32; 4] {
        let (r, g, b) = hsl_to_rgb(self.hue / 360.0, self.saturation, self.lightness);
        [r, g, b, 1.0]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self::from_hue(217.0)
    }
}

impl fmt::Display for CursorColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_css())
    }
}

/// Error returned when a color string is not of the form `hsl(h, s%, l%)`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid cursor color: {0:?}")]
pub struct ColorParseError(pub String);

impl FromStr for CursorColor {
    type Err = ColorParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ColorParseError(s.to_string());
        let inner = s
            .trim()
            .strip_prefix("hsl(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;

        let mut parts = inner.split(',').map(str::trim);
        let hue: f32 = parts.next().and_then(|p| p.parse().ok()).ok_or_else(invalid)?;
        let mut percent = || -> Option<f32> {
            let value: f32 = parts.next()?.strip_suffix('%')?.trim().parse().ok()?;
            (0.0..=100.0).contains(&value).then_some(value / 100.0)
        };
        let saturation = percent().ok_or_else(invalid)?;
        let lightness = percent().ok_or_else(invalid)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            hue: hue.rem_euclid(360.0),
            saturation,
            lightness,
        })
    }
}

impl From<CursorColor> for String {
    fn from(color: CursorColor) -> Self {
        color.to_css()
    }
}

impl TryFrom<String> for CursorColor {
    type Error = ColorParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// A participant attached to a document session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Stable account id supplied by the identity provider.
    pub user_id: Uuid,
    pub display_name: String,
    pub email: String,
    /// Session-scoped color, never persisted.
    pub color: CursorColor,
}

impl Identity {
    /// Build the identity for a new attach, drawing a random color.
    pub fn new(user_id: Uuid, display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            email: email.into(),
            color: CursorColor::random(),
        }
    }

    /// Replace the color. Attaching a session draws a new one regardless.
    pub fn with_color(mut self, color: CursorColor) -> Self {
        self.color = color;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_css_format() {
        let color = CursorColor::from_hue(210.0);
        assert_eq!(color.to_css(), "hsl(210, 70%, 60%)");
        assert_eq!(color.to_string(), color.to_css());
    }

    #[test]
    fn test_color_parse_roundtrip() {
        let parsed: CursorColor = "hsl(42, 70%, 60%)".parse().unwrap();
        assert_eq!(parsed, CursorColor::from_hue(42.0));
    }

    #[test]
    fn test_color_parse_rejects_garbage() {
        assert!("rgb(1, 2, 3)".parse::<CursorColor>().is_err());
        assert!("hsl(10, 70, 60%)".parse::<CursorColor>().is_err());
        assert!("hsl(10, 170%, 60%)".parse::<CursorColor>().is_err());
        assert!("hsl(10, 70%, 60%, 1)".parse::<CursorColor>().is_err());
    }

    #[test]
    fn test_color_hue_wraps() {
        assert_eq!(CursorColor::from_hue(370.0).hue, 10.0);
        assert_eq!(CursorColor::from_hue(-30.0).hue, 330.0);
    }

    #[test]
    fn test_color_from_uuid_stable() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(CursorColor::from_uuid(id), CursorColor::from_uuid(id));
    }

    #[test]
    fn test_random_color_in_range() {
        for _ in 0..32 {
            let color = CursorColor::random();
            assert!((0.0..360.0).contains(&color.hue));
        }
    }

    #[test]
    fn test_rgba_components_in_unit_range() {
        let rgba = CursorColor::from_hue(300.0).to_rgba();
        assert!(rgba.iter().all(|c| (0.0..=1.0).contains(c)));
        assert_eq!(rgba[3], 1.0);
    }

    #[test]
    fn test_identity_json_uses_camel_case() {
        let identity = Identity::new(Uuid::new_v4(), "Alice", "alice@example.com")
            .with_color(CursorColor::from_hue(120.0));
        let json = serde_json::to_value(&identity).unwrap();

        assert_eq!(json["displayName"], "Alice");
        assert_eq!(json["color"], "hsl(120, 70%, 60%)");
        assert!(json.get("userId").is_some());
    }
}
