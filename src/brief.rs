//! Storyboard → implementation brief.
//!
//! [`compile`] is a pure function of its inputs: the same storyboard and
//! context always produce byte-identical text. The brief is the only thing
//! handed to the generator besides the workspace itself, so everything the
//! tool needs (scene text, timings, assets, the exact render command) is
//! spelled out literally.

use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;

use serde_json::{json, Value};

use crate::adapters::{DirectorOutput, Storyboard};
use crate::audio::AudioManifest;
use crate::error::{PipelineError, PipelineResult};

pub const FPS: u32 = 30;
pub const BRIEF_FILE_NAME: &str = "TASK_BRIEF.md";

/// Instruction passed to the generator on its command line.
pub const GENERATOR_PROMPT: &str = "Read the file TASK_BRIEF.md in your working directory. \
It contains the product you need to promote and full instructions. Create a completely new \
Remotion video from scratch: delete all existing scene files and create your own.";

/// Everything besides the storyboard that ends up in the brief.
#[derive(Debug, Clone, Default)]
pub struct BriefContext<'a> {
    /// File name the render must produce under `out/`.
    pub output_name: &'a str,
    /// Local file names of images already placed in `public/`.
    pub images: &'a [String],
    pub audio: Option<&'a AudioManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Brief {
    text: String,
}

impl Brief {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Write the brief into `dir`. Fails if a brief is already there.
    pub fn write_once(&self, dir: &Path) -> PipelineResult<()> {
        let path = dir.join(BRIEF_FILE_NAME);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| PipelineError::workspace(&format!("create {}", path.display()), e))?;
        file.write_all(self.text.as_bytes())
            .map_err(|e| PipelineError::workspace(&format!("write {}", path.display()), e))
    }
}

pub fn frames(seconds: f64) -> u64 {
    (seconds * FPS as f64).round().max(0.0) as u64
}

pub fn compile(storyboard: &Storyboard, ctx: &BriefContext<'_>) -> Brief {
    let total_frames = frames(storyboard.total_duration_seconds);
    let mut out = String::new();

    // `write!` into a String cannot fail.
    let _ = writeln!(out, "# Video Implementation Brief\n");
    let _ = writeln!(out, "## Product: {}\n", storyboard.product_name);
    let _ = writeln!(out, "## Creative Concept\n{}\n", storyboard.video_concept);

    let _ = writeln!(out, "## Color Palette");
    for color in &storyboard.color_palette {
        let _ = writeln!(out, "- `{}`", color);
    }
    let _ = writeln!(out, "\n## Closing CTA\n\"{}\"\n", storyboard.closing_cta);

    if !ctx.images.is_empty() {
        let _ = writeln!(out, "## Images\nAlready downloaded to `public/`; reference them with `staticFile()`:");
        for image in ctx.images {
            let _ = writeln!(out, "- `{}`", image);
        }
        let _ = writeln!(out);
    }

    if let Some(audio) = ctx.audio.filter(|a| !a.is_empty()) {
        let _ = writeln!(out, "## Audio\nAlready generated in `public/`; do not download them.");
        for clip in &audio.voiceovers {
            let _ = writeln!(
                out,
                "- Scene {}: `{}` (~{:.1}s) \"{}\"",
                clip.scene_number, clip.filename, clip.duration_estimate, clip.script
            );
        }
        if let Some(music) = &audio.music {
            let _ = writeln!(out, "- Background music: `{}` (loop, volume 0.15)", music);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(
        out,
        "## Scenes\nTotal duration: {}s ({} frames at {}fps)\n",
        storyboard.total_duration_seconds, total_frames, FPS
    );
    for scene in &storyboard.scenes {
        let _ = writeln!(out, "### Scene {}: {}", scene.scene_number, scene.scene_name);
        let _ = writeln!(
            out,
            "- Duration: {}s ({} frames)",
            scene.duration_seconds,
            frames(scene.duration_seconds)
        );
        let _ = writeln!(out, "- Headline: \"{}\"", scene.headline_text);
        if !scene.supporting_text.is_empty() {
            let _ = writeln!(out, "- Supporting text: \"{}\"", scene.supporting_text);
        }
        let _ = writeln!(out, "- Visual concept: {}", scene.visual_concept);
        if !scene.animation_notes.is_empty() {
            let _ = writeln!(out, "- Animation notes: {}", scene.animation_notes);
        }
        if let Some(clip) = ctx
            .audio
            .and_then(|a| a.voiceovers.iter().find(|c| c.scene_number == scene.scene_number))
        {
            let _ = writeln!(out, "- Voiceover: `{}`", clip.filename);
        }
        let _ = writeln!(out);
    }

    let _ = writeln!(out, "---\n\n## Steps\n");
    let steps = [
        "Delete every file in `src/scenes/`, plus `src/types.ts` and `src/SignalPromo.tsx`.".to_string(),
        "Create one `.tsx` component per scene in `src/scenes/`, using the literal text above.".to_string(),
        "Create `src/PromoVideo.tsx` composing the scenes in order with `<Series>` or `<TransitionSeries>`."
            .to_string(),
        format!(
            "Register composition `PromoVideo` in `src/Root.tsx`: 1920x1080, {} fps, {} frames.",
            FPS, total_frames
        ),
        "Wire voiceovers inside their scenes with `<Audio src={staticFile(...)} volume={0.8} />` and background music at the root with `loop volume={0.15}`.".to_string(),
        format!(
            "Render: `npx remotion render PromoVideo out/{} --concurrency=1`.",
            ctx.output_name
        ),
        format!("Verify `out/{}` exists and is not empty.", ctx.output_name),
    ];
    for (i, step) in steps.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, step);
    }

    let _ = writeln!(out, "\n## Do Not\n");
    let _ = writeln!(out, "- Keep any existing template scene code.");
    let _ = writeln!(out, "- Install new npm packages.");
    let _ = writeln!(out, "- Use placeholder text instead of the storyboard text.");
    let _ = writeln!(out, "- Shorten a scene below its voiceover length.");

    let _ = write!(out, "\n## Output\nThe final video MUST be at `out/{}`.\n", ctx.output_name);

    Brief { text: out }
}

/// Props document the template project reads from `src/configs/signal.json`.
pub fn props_document(director: &DirectorOutput) -> Value {
    json!({ "config": director })
}
