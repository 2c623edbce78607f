//! Video planning over the chat-completions client.
//!
//! Templated jobs get a [`DirectorOutput`] that fills the fixed template's
//! props; agentic jobs get an open-ended [`Storyboard`] for the generator.

use std::sync::Arc;

use async_trait::async_trait;

use super::analyst::parse_reply;
use super::schema::{Analysis, DirectorOutput, PageData, Plan, Storyboard, LOGO_ICONS, MUSIC_STYLES};
use super::Planner;
use crate::error::PipelineResult;
use crate::job::RenderMode;
use crate::llm::{ChatMessage, ChatOptions, LlmClient};

const DESCRIPTION_CHARS: usize = 2_000;

fn director_prompt() -> String {
    format!(
        r##"You are a creative director and copywriter for a short, high-impact promo video.
Translate the product details into a JSON configuration for a fixed video template.

Tone: the problem hooks the viewer and creates tension; the solution is the "aha" moment.
Pick colors that match the product's industry, with high contrast between text and background.

Reply with one JSON object shaped like:
{{
  "product": {{"name": "...", "tagline": "...", "logo": {{"icon": "...", "primaryColor": "#RRGGBB", "secondaryColor": "#RRGGBB"}}}},
  "problem": {{"line1": "...", "line2": "...", "accentColor": "#RRGGBB"}},
  "solution": {{"headline": "...", "subline": "..."}},
  "screenshots": [{{"src": "https://...", "callouts": [{{"icon": "emoji", "text": "..."}}]}}],
  "outro": {{"tagline": "...", "badge": {{"icon": "emoji", "text": "...", "color": "#RRGGBB"}}}},
  "theme": {{"primary": "#RRGGBB", "accent": "#RRGGBB", "background": "#RRGGBB", "text": "#RRGGBB"}}
}}

Strict limits:
- product.name: at most 10 characters, ALL CAPS
- product.tagline: at most 50 characters
- product.logo.icon: one of {icons}
- problem.line1: at most 40 characters; problem.line2: at most 25
- solution.headline: at most 45 characters; solution.subline: at most 30
- screenshots: 1 or 2 entries, each with at most 3 callouts of at most 30 characters
- outro.tagline: at most 40 characters; badge text at most 35 (badge is optional)
- every color is a hex code such as #FF0000

Use the available image URLs for screenshot "src" when they are relevant.
If none are available use a placeholder image URL. Never leave "src" empty."##,
        icons = LOGO_ICONS.join(", ")
    )
}

fn storyboard_prompt() -> String {
    format!(
        r##"You are a world-class creative director and motion designer.
Design an original promotional video storyboard from scratch; a Remotion developer will
implement it, so be specific about layout, text and motion in every scene.

Story arc: hook in the first two seconds, the problem, the solution shown visually,
proof or key features, then a memorable call to action.

For each scene describe what the viewer sees, the text on screen, how elements move and
the mood. Write a short voiceover_script (one or two sentences) per scene and make each
duration_seconds long enough for it plus about a second of breathing room.

Constraints: 15 to 25 seconds total at 30fps and 1920x1080, system fonts only, images only
from the provided URL list (or none, designing with typography and shapes instead).

Reply with one JSON object with these fields:
- product_name (string), video_concept (string)
- color_palette: 3 to 6 hex colors
- total_duration_seconds (number)
- scenes: 3 to 7 objects with scene_number (1, 2, 3... in order), scene_name,
  duration_seconds, headline_text, supporting_text, visual_concept, animation_notes,
  voiceover_script
- image_urls: the subset of provided images to use
- closing_cta (string)
- background_music_style: one of {styles}"##,
        styles = MUSIC_STYLES.join(", ")
    )
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn bullet_list(items: &[String], empty: &str) -> String {
    if items.is_empty() {
        return empty.to_string();
    }
    items
        .iter()
        .map(|item| format!("- {}", item))
        .collect::<Vec<_>>()
        .join("\n")
}

/// User message shared by both plan kinds.
pub(crate) fn plan_context(page: &PageData, analysis: &Analysis) -> String {
    format!(
        "Product: {title}\n\nAnalysis:\n- Hook: {hook}\n- Solution: {solution}\n- Tech stack: {stack}\n\n\
         Description:\n{description}\n\nKey features:\n{features}\n\nAvailable images:\n{images}",
        title = page.title,
        hook = analysis.hook,
        solution = analysis.solution,
        stack = analysis.stack,
        description = truncate(&page.description, DESCRIPTION_CHARS),
        features = bullet_list(&page.features, "Not specified, infer from the description"),
        images = bullet_list(&page.gallery, "None available"),
    )
}

pub struct LlmPlanner {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl LlmPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Planner for LlmPlanner {
    async fn plan(&self, page: &PageData, analysis: &Analysis, mode: RenderMode) -> PipelineResult<Plan> {
        let system = match mode {
            RenderMode::Templated => director_prompt(),
            RenderMode::Agentic => storyboard_prompt(),
        };
        let messages = [
            ChatMessage::system(system),
            ChatMessage::user(plan_context(page, analysis)),
        ];

        tracing::debug!(mode = %mode, model = %self.model, "Requesting video plan");
        let response = self
            .llm
            .chat_completion(&self.model, &messages, ChatOptions::json())
            .await?;

        Ok(match mode {
            RenderMode::Templated => Plan::Director(parse_reply::<DirectorOutput>(response.content, "director")?),
            RenderMode::Agentic => Plan::Storyboard(parse_reply::<Storyboard>(response.content, "storyboard")?),
        })
    }
}
