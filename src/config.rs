use serde::{Deserialize, Serialize};

/// Size of the mirrored application's client area, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScreenMetrics {
    pub width: u32,
    pub height: u32,
}

impl ScreenMetrics {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Evaluated form of a mode dimension expression.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Dimension {
    Pixels(i32),
    /// Percentage of the matching screen axis.
    Percent(f32),
    /// Screen axis minus this many pixels.
    Inset(i32),
}

impl Default for Dimension {
    fn default() -> Self {
        Dimension::Percent(100.0)
    }
}

impl Dimension {
    pub fn evaluate(&self, axis: u32) -> i32 {
        match *self {
            Dimension::Pixels(px) => px,
            Dimension::Percent(pct) => ((axis as f32) * pct / 100.0).round() as i32,
            Dimension::Inset(px) => axis as i32 - px,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedGeometry {
    pub rect: Rect,
    pub screen: ScreenMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeConfig {
    pub id: String,
    #[serde(default = "default_origin")]
    pub x: Dimension,
    #[serde(default = "default_origin")]
    pub y: Dimension,
    #[serde(default)]
    pub width: Dimension,
    #[serde(default)]
    pub height: Dimension,
    #[serde(default)]
    pub mirrors: Vec<String>,
    #[serde(default)]
    pub window_overlays: Vec<String>,
    /// Recomputed whenever the screen size changes.
    #[serde(skip)]
    pub resolved: Option<ResolvedGeometry>,
}

fn default_origin() -> Dimension {
    Dimension::Pixels(0)
}

impl ModeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            x: default_origin(),
            y: default_origin(),
            width: Dimension::default(),
            height: Dimension::default(),
            mirrors: Vec::new(),
            window_overlays: Vec::new(),
            resolved: None,
        }
    }

    /// Evaluates the mode's dimensions against `screen`. Width and height are
    /// clamped to at least one pixel.
    pub fn evaluate(&self, screen: ScreenMetrics) -> Rect {
        let width = self.width.evaluate(screen.width).max(1) as u32;
        let height = self.height.evaluate(screen.height).max(1) as u32;
        Rect {
            x: self.x.evaluate(screen.width),
            y: self.y.evaluate(screen.height),
            width,
            height,
        }
    }

    /// Cached geometry when it was computed for `screen`, a fresh evaluation otherwise.
    pub fn geometry_for(&self, screen: ScreenMetrics) -> Rect {
        match self.resolved {
            Some(resolved) if resolved.screen == screen => resolved.rect,
            _ => self.evaluate(screen),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            x: 0,
            y: 0,
            scale: default_scale(),
        }
    }
}

fn default_scale() -> f32 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorKey {
    pub color: [u8; 3],
    #[serde(default)]
    pub tolerance: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub name: String,
    pub source: Rect,
    #[serde(default)]
    pub output: Placement,
    #[serde(default)]
    pub color_key: Option<ColorKey>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPriority {
    TitleOnly,
    #[default]
    TitleClassExecutable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMethod {
    /// PrintWindow, falling back to BitBlt.
    #[default]
    Auto,
    PrintWindow,
    BitBlt,
}

impl CaptureMethod {
    pub fn is_fallback_chain(self) -> bool {
        matches!(self, CaptureMethod::Auto)
    }
}

/// Pixels trimmed from each edge of the captured client area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Crop {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowOverlayConfig {
    pub name: String,
    #[serde(default)]
    pub window_title: String,
    #[serde(default)]
    pub window_class: String,
    #[serde(default)]
    pub executable_name: String,
    #[serde(default)]
    pub match_priority: MatchPriority,
    #[serde(default)]
    pub crop: Crop,
    #[serde(default)]
    pub capture_method: CaptureMethod,
    #[serde(default = "default_overlay_fps")]
    pub fps: u32,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_overlay_fps() -> u32 {
    30
}

impl WindowOverlayConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            window_title: String::new(),
            window_class: String::new(),
            executable_name: String::new(),
            match_priority: MatchPriority::default(),
            crop: Crop::default(),
            capture_method: CaptureMethod::default(),
            fps: default_overlay_fps(),
            placement: Placement::default(),
            enabled: true,
        }
    }

    /// True when `other` targets a different window, so any bound handle is stale.
    pub fn target_differs(&self, other: &WindowOverlayConfig) -> bool {
        self.window_title != other.window_title
            || self.window_class != other.window_class
            || self.executable_name != other.executable_name
            || self.match_priority != other.match_priority
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotkeyBinding {
    /// Unparsed key combination, e.g. `"ctrl+F1"`.
    pub keys: String,
    pub mode: String,
    #[serde(default)]
    pub secondary_mode: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    Linear,
    #[default]
    EaseOutCubic,
    EaseInOutQuad,
}

impl Easing {
    pub fn apply(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseOutCubic => 1.0 - (1.0 - t).powi(3),
            Easing::EaseInOutQuad => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    1.0 - (-2.0 * t + 2.0).powi(2) / 2.0
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionSettings {
    pub duration_ms: u64,
    #[serde(default)]
    pub easing: Easing,
}

impl Default for TransitionSettings {
    fn default() -> Self {
        Self {
            duration_ms: 250,
            easing: Easing::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugFlags {
    #[serde(default)]
    pub log_window_search: bool,
    #[serde(default)]
    pub log_capture_timing: bool,
    #[serde(default)]
    pub show_capture_stats: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub modes: Vec<ModeConfig>,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    #[serde(default)]
    pub window_overlays: Vec<WindowOverlayConfig>,
    #[serde(default)]
    pub hotkeys: Vec<HotkeyBinding>,
    #[serde(default = "default_mode_id")]
    pub default_mode: String,
    #[serde(default)]
    pub transition: TransitionSettings,
    #[serde(default)]
    pub debug: DebugFlags,
    #[serde(default = "default_window_search_interval_ms")]
    pub window_search_interval_ms: u64,
    #[serde(default = "default_log_retention")]
    pub log_retention_count: usize,
}

fn default_true() -> bool {
    true
}

fn default_mode_id() -> String {
    "fullscreen".to_string()
}

fn default_window_search_interval_ms() -> u64 {
    1000
}

fn default_log_retention() -> usize {
    10
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            modes: vec![ModeConfig::new(default_mode_id())],
            mirrors: Vec::new(),
            window_overlays: Vec::new(),
            hotkeys: Vec::new(),
            default_mode: default_mode_id(),
            transition: TransitionSettings::default(),
            debug: DebugFlags::default(),
            window_search_interval_ms: default_window_search_interval_ms(),
            log_retention_count: default_log_retention(),
        }
    }
}

impl Configuration {
    pub fn mode(&self, id: &str) -> Option<&ModeConfig> {
        self.modes.iter().find(|m| m.id == id)
    }

    pub fn window_overlay(&self, name: &str) -> Option<&WindowOverlayConfig> {
        self.window_overlays.iter().find(|o| o.name == name)
    }

    pub fn hotkey(&self, keys: &str) -> Option<&HotkeyBinding> {
        self.hotkeys.iter().find(|h| h.keys == keys)
    }

    /// Refreshes every mode's computed geometry. Returns true if any value changed.
    pub fn recalculate_dimensions(&mut self, screen: ScreenMetrics) -> bool {
        let mut changed = false;
        for mode in &mut self.modes {
            let resolved = Some(ResolvedGeometry {
                rect: mode.evaluate(screen),
                screen,
            });
            if mode.resolved != resolved {
                mode.resolved = resolved;
                changed = true;
            }
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dimensions_evaluate_against_axis() {
        assert_eq!(Dimension::Pixels(320).evaluate(1920), 320);
        assert_eq!(Dimension::Percent(50.0).evaluate(1080), 540);
        assert_eq!(Dimension::Inset(100).evaluate(1920), 1820);
    }

    #[test]
    fn geometry_for_ignores_stale_resolution() {
        let mut cfg = Configuration::default();
        let small = ScreenMetrics::new(1920, 1080);
        let large = ScreenMetrics::new(2560, 1440);
        assert!(cfg.recalculate_dimensions(small));
        assert!(!cfg.recalculate_dimensions(small));

        let mode = cfg.mode("fullscreen").unwrap();
        assert_eq!(mode.geometry_for(small).width, 1920);
        assert_eq!(mode.geometry_for(large).width, 2560);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let cfg: Configuration = serde_json::from_str(
            r#"{ "window_overlays": [ { "name": "chat", "window_title": "Chat" } ] }"#,
        )
        .unwrap();
        assert_eq!(cfg.window_search_interval_ms, 1000);
        assert_eq!(cfg.default_mode, "fullscreen");
        let overlay = cfg.window_overlay("chat").unwrap();
        assert_eq!(overlay.fps, 30);
        assert_eq!(overlay.capture_method, CaptureMethod::Auto);
        assert!(overlay.enabled);
    }

    #[test]
    fn easing_curves_hit_endpoints() {
        for easing in [Easing::Linear, Easing::EaseOutCubic, Easing::EaseInOutQuad] {
            assert_eq!(easing.apply(0.0), 0.0);
            assert!((easing.apply(1.0) - 1.0).abs() < f32::EPSILON);
        }
        assert!(Easing::EaseOutCubic.apply(0.5) > 0.5);
    }
}
