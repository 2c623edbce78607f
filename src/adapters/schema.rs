//! Typed payloads exchanged with the scraping and LLM adapters, and the
//! structural checks applied to LLM output.

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, PipelineResult};
use crate::job::RenderMode;

/// Normalized page content, whichever provider produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PageData {
    pub title: String,
    #[serde(default)]
    pub tagline: String,
    #[serde(default)]
    pub description: String,
    /// Image URLs worth showing (og:image and friends).
    #[serde(default)]
    pub gallery: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub markdown: String,
    /// Provider name.
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Analysis {
    /// The core problem the product addresses.
    pub hook: String,
    pub solution: String,
    /// Key technologies.
    pub stack: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Templated plan
// ─────────────────────────────────────────────────────────────────────────────

pub const LOGO_ICONS: &[&str] = &["pulse", "rocket", "chart", "bolt"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Logo {
    pub icon: String,
    pub primary_color: String,
    pub secondary_color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub name: String,
    pub tagline: String,
    pub logo: Logo,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub line1: String,
    pub line2: String,
    pub accent_color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Solution {
    pub headline: String,
    pub subline: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Callout {
    pub icon: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Screenshot {
    /// Image URL from the model; rewritten to a local file name before render.
    pub src: String,
    #[serde(default)]
    pub callouts: Vec<Callout>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Badge {
    pub icon: String,
    pub text: String,
    pub color: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Outro {
    pub tagline: String,
    #[serde(default)]
    pub badge: Option<Badge>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Theme {
    pub primary: String,
    pub accent: String,
    pub background: String,
    pub text: String,
}

/// Fixed-schema output that fills the template project's props.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectorOutput {
    pub product: Product,
    pub problem: Problem,
    pub solution: Solution,
    pub screenshots: Vec<Screenshot>,
    pub outro: Outro,
    pub theme: Theme,
}

// ─────────────────────────────────────────────────────────────────────────────
// Agentic plan
// ─────────────────────────────────────────────────────────────────────────────

pub const MUSIC_STYLES: &[&str] = &["upbeat", "calm", "dramatic", "corporate", "none"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scene {
    pub scene_number: u32,
    pub scene_name: String,
    pub duration_seconds: f64,
    pub headline_text: String,
    #[serde(default)]
    pub supporting_text: String,
    pub visual_concept: String,
    #[serde(default)]
    pub animation_notes: String,
    #[serde(default)]
    pub voiceover_script: String,
}

/// Open-ended scene-by-scene plan for the code-generation tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Storyboard {
    pub product_name: String,
    pub video_concept: String,
    pub color_palette: Vec<String>,
    pub total_duration_seconds: f64,
    pub scenes: Vec<Scene>,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub closing_cta: String,
    #[serde(default = "default_music_style")]
    pub background_music_style: String,
}

fn default_music_style() -> String {
    "upbeat".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "plan", rename_all = "snake_case")]
pub enum Plan {
    Director(DirectorOutput),
    Storyboard(Storyboard),
}

impl Plan {
    pub fn mode(&self) -> RenderMode {
        match self {
            Self::Director(_) => RenderMode::Templated,
            Self::Storyboard(_) => RenderMode::Agentic,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Validation
// ─────────────────────────────────────────────────────────────────────────────

/// Structural checks for provider payloads.
pub trait Validate {
    fn collect_violations(&self, out: &mut Violations);

    /// All violations at once, as a [`PipelineError::Schema`].
    fn validate(&self) -> PipelineResult<()> {
        let mut violations = Violations::default();
        self.collect_violations(&mut violations);
        violations.into_result()
    }
}

#[derive(Debug, Default)]
pub struct Violations(Vec<String>);

impl Violations {
    fn non_empty(&mut self, field: &str, value: &str) {
        if value.trim().is_empty() {
            self.0.push(format!("{} must not be empty", field));
        }
    }

    fn max_chars(&mut self, field: &str, value: &str, max: usize) {
        self.non_empty(field, value);
        let len = value.chars().count();
        if len > max {
            self.0.push(format!("{} is {} chars, max {}", field, len, max));
        }
    }

    fn hex_color(&mut self, field: &str, value: &str) {
        if !is_hex_color(value) {
            self.0.push(format!("{} '{}' is not a hex color", field, value));
        }
    }

    fn one_of(&mut self, field: &str, value: &str, allowed: &[&str]) {
        if !allowed.contains(&value) {
            self.0.push(format!(
                "{} '{}' must be one of {}",
                field,
                value,
                allowed.join(", ")
            ));
        }
    }

    fn count_between(&mut self, field: &str, len: usize, min: usize, max: usize) {
        if len < min || len > max {
            self.0.push(format!("{} has {} items, expected {}..={}", field, len, min, max));
        }
    }

    fn into_result(self) -> PipelineResult<()> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(PipelineError::Schema(self.0.join("; ")))
        }
    }
}

fn is_hex_color(value: &str) -> bool {
    let Some(digits) = value.strip_prefix('#') else {
        return false;
    };
    matches!(digits.len(), 3 | 6 | 8) && digits.chars().all(|c| c.is_ascii_hexdigit())
}

impl Validate for Analysis {
    fn collect_violations(&self, out: &mut Violations) {
        out.non_empty("hook", &self.hook);
        out.non_empty("solution", &self.solution);
        out.non_empty("stack", &self.stack);
    }
}

impl Validate for DirectorOutput {
    fn collect_violations(&self, out: &mut Violations) {
        out.max_chars("product.name", &self.product.name, 10);
        out.max_chars("product.tagline", &self.product.tagline, 50);
        out.one_of("product.logo.icon", &self.product.logo.icon, LOGO_ICONS);
        out.hex_color("product.logo.primaryColor", &self.product.logo.primary_color);
        out.hex_color("product.logo.secondaryColor", &self.product.logo.secondary_color);

        out.max_chars("problem.line1", &self.problem.line1, 40);
        out.max_chars("problem.line2", &self.problem.line2, 25);
        out.hex_color("problem.accentColor", &self.problem.accent_color);

        out.max_chars("solution.headline", &self.solution.headline, 45);
        out.max_chars("solution.subline", &self.solution.subline, 30);

        out.count_between("screenshots", self.screenshots.len(), 1, 2);
        for (i, shot) in self.screenshots.iter().enumerate() {
            out.count_between(&format!("screenshots[{}].callouts", i), shot.callouts.len(), 0, 3);
            for (j, callout) in shot.callouts.iter().enumerate() {
                out.max_chars(&format!("screenshots[{}].callouts[{}].text", i, j), &callout.text, 30);
            }
        }

        out.max_chars("outro.tagline", &self.outro.tagline, 40);
        if let Some(badge) = &self.outro.badge {
            out.max_chars("outro.badge.text", &badge.text, 35);
            out.hex_color("outro.badge.color", &badge.color);
        }

        out.hex_color("theme.primary", &self.theme.primary);
        out.hex_color("theme.accent", &self.theme.accent);
        out.hex_color("theme.background", &self.theme.background);
        out.hex_color("theme.text", &self.theme.text);
    }
}

impl Validate for Storyboard {
    fn collect_violations(&self, out: &mut Violations) {
        out.non_empty("product_name", &self.product_name);
        out.non_empty("video_concept", &self.video_concept);
        out.non_empty("closing_cta", &self.closing_cta);

        out.count_between("color_palette", self.color_palette.len(), 3, 6);
        for (i, color) in self.color_palette.iter().enumerate() {
            out.hex_color(&format!("color_palette[{}]", i), color);
        }

        if !(self.total_duration_seconds > 0.0) {
            out.0.push("total_duration_seconds must be positive".to_string());
        }
        out.one_of("background_music_style", &self.background_music_style, MUSIC_STYLES);

        out.count_between("scenes", self.scenes.len(), 3, 7);
        for (i, scene) in self.scenes.iter().enumerate() {
            let expected = i as u32 + 1;
            if scene.scene_number != expected {
                out.0.push(format!(
                    "scenes[{}].scene_number is {}, expected {}",
                    i, scene.scene_number, expected
                ));
            }
            if !(scene.duration_seconds > 0.0) {
                out.0.push(format!("scenes[{}].duration_seconds must be positive", i));
            }
            out.non_empty(&format!("scenes[{}].scene_name", i), &scene.scene_name);
            out.non_empty(&format!("scenes[{}].headline_text", i), &scene.headline_text);
            out.non_empty(&format!("scenes[{}].visual_concept", i), &scene.visual_concept);
        }
    }
}

impl Validate for Plan {
    fn collect_violations(&self, out: &mut Violations) {
        match self {
            Self::Director(d) => d.collect_violations(out),
            Self::Storyboard(s) => s.collect_violations(out),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn schema_message(result: PipelineResult<()>) -> String {
        match result {
            Err(PipelineError::Schema(msg)) => msg,
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_fixtures_pass() {
        assert!(director().validate().is_ok());
        assert!(storyboard().validate().is_ok());
    }

    #[test]
    fn test_director_length_limits_are_enforced() {
        let mut d = director();
        d.product.name = "SUPERLONGNAME".into();
        d.product.logo.icon = "star".into();
        d.theme.text = "white".into();

        let msg = schema_message(d.validate());
        assert!(msg.contains("product.name is 13 chars, max 10"));
        assert!(msg.contains("product.logo.icon 'star'"));
        assert!(msg.contains("theme.text 'white' is not a hex color"));
    }

    #[test]
    fn test_director_needs_one_or_two_screenshots() {
        let mut d = director();
        d.screenshots.clear();
        assert!(schema_message(d.validate()).contains("screenshots has 0 items"));
    }

    #[test]
    fn test_storyboard_scene_count_and_numbering() {
        let mut s = storyboard();
        s.scenes.truncate(2);
        assert!(schema_message(s.validate()).contains("scenes has 2 items, expected 3..=7"));

        let mut s = storyboard();
        s.scenes[1].scene_number = 5;
        assert!(schema_message(s.validate()).contains("scenes[1].scene_number is 5, expected 2"));
    }

    #[test]
    fn test_storyboard_music_style_and_palette() {
        let mut s = storyboard();
        s.background_music_style = "jazz".into();
        s.color_palette = vec!["#000".into(), "blue".into()];
        let msg = schema_message(s.validate());
        assert!(msg.contains("background_music_style 'jazz'"));
        assert!(msg.contains("color_palette has 2 items"));
        assert!(msg.contains("color_palette[1] 'blue'"));
    }

    #[test]
    fn test_analysis_requires_all_fields() {
        let a = Analysis {
            hook: "Slow dashboards".into(),
            solution: " ".into(),
            stack: "Rust".into(),
        };
        assert!(schema_message(a.validate()).contains("solution must not be empty"));
    }

    #[test]
    fn test_director_props_use_camel_case() {
        let json = serde_json::to_value(director()).unwrap();
        assert!(json["product"]["logo"].get("primaryColor").is_some());
        assert!(json["problem"].get("accentColor").is_some());
    }

    #[test]
    fn test_storyboard_defaults_music_style() {
        let mut json = serde_json::to_value(storyboard()).unwrap();
        json.as_object_mut().unwrap().remove("background_music_style");
        let parsed: Storyboard = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.background_music_style, "upbeat");
    }
}
