//! Voiceover synthesis and background music for agentic jobs.
//!
//! Audio is decoration: every failure here is logged and skipped, never
//! propagated into the job's outcome.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapters::Storyboard;

const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const ELEVENLABS_MODEL: &str = "eleven_turbo_v2_5";
const SYNTH_TIMEOUT: Duration = Duration::from_secs(30);
const WORDS_PER_SECOND: f64 = 2.5;
pub const MUSIC_FILE_NAME: &str = "background_music.mp3";

/// Text-to-speech backend.
#[async_trait]
pub trait VoiceSynth: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Bytes>;
}

pub struct ElevenLabsClient {
    client: reqwest::Client,
    api_key: String,
    voice_id: String,
}

impl ElevenLabsClient {
    pub fn new(api_key: String, voice_id: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SYNTH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key,
            voice_id,
        }
    }
}

#[async_trait]
impl VoiceSynth for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Bytes> {
        let url = format!("{}/text-to-speech/{}", ELEVENLABS_BASE_URL, self.voice_id);
        let resp = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .header("Accept", "audio/mpeg")
            .json(&json!({
                "text": text,
                "model_id": ELEVENLABS_MODEL,
                "voice_settings": {"stability": 0.5, "similarity_boost": 0.75}
            }))
            .send()
            .await
            .context("text-to-speech request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("text-to-speech returned {}: {}", status, body);
        }
        resp.bytes().await.context("failed to read audio body")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceoverClip {
    pub scene_number: u32,
    pub filename: String,
    pub script: String,
    /// Seconds, from word count.
    pub duration_estimate: f64,
}

/// Audio files placed in the workspace's `public/` directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AudioManifest {
    pub voiceovers: Vec<VoiceoverClip>,
    pub music: Option<String>,
}

impl AudioManifest {
    pub fn is_empty(&self) -> bool {
        self.voiceovers.is_empty() && self.music.is_none()
    }
}

pub fn estimate_duration(script: &str) -> f64 {
    let words = script.split_whitespace().count() as f64;
    (words / WORDS_PER_SECOND * 10.0).round() / 10.0
}

/// Synthesize one clip per scene that has a script. Scenes whose synthesis
/// fails simply have no voiceover.
pub async fn generate_voiceovers(
    synth: &dyn VoiceSynth,
    storyboard: &Storyboard,
    public_dir: &Path,
) -> Vec<VoiceoverClip> {
    let mut clips = Vec::new();

    for scene in &storyboard.scenes {
        let script = scene.voiceover_script.trim();
        if script.is_empty() {
            continue;
        }
        let filename = format!("voiceover_scene_{}.mp3", scene.scene_number);

        let written = async {
            let audio = synth.synthesize(script).await?;
            tokio::fs::write(public_dir.join(&filename), &audio)
                .await
                .with_context(|| format!("failed to write {}", filename))
        }
        .await;

        match written {
            Ok(()) => {
                tracing::debug!(scene = scene.scene_number, file = %filename, "Voiceover saved");
                clips.push(VoiceoverClip {
                    scene_number: scene.scene_number,
                    filename,
                    script: script.to_string(),
                    duration_estimate: estimate_duration(script),
                });
            }
            Err(e) => {
                tracing::warn!(scene = scene.scene_number, "Voiceover skipped: {:#}", e);
            }
        }
    }

    clips
}

/// Copy `background_{style}.mp3` from the music library into `public/`.
/// Returns the file name in `public/`, or `None` when there is no music.
pub async fn prepare_background_music(
    music_dir: Option<&Path>,
    style: &str,
    public_dir: &Path,
) -> Option<String> {
    if style == "none" {
        return None;
    }
    let music_dir = music_dir?;
    let source = music_dir.join(format!("background_{}.mp3", style));

    match tokio::fs::copy(&source, public_dir.join(MUSIC_FILE_NAME)).await {
        Ok(_) => Some(MUSIC_FILE_NAME.to_string()),
        Err(e) => {
            tracing::warn!(path = %source.display(), "Background music unavailable: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::schema::fixtures;

    struct FakeSynth;

    #[async_trait]
    impl VoiceSynth for FakeSynth {
        async fn synthesize(&self, text: &str) -> anyhow::Result<Bytes> {
            if text.contains("fail") {
                bail!("quota exceeded");
            }
            Ok(Bytes::from(format!("mp3:{}", text)))
        }
    }

    #[test]
    fn test_estimate_duration() {
        assert_eq!(estimate_duration("one two three four five"), 2.0);
        assert_eq!(estimate_duration("Meet Bolt."), 0.8);
        assert_eq!(estimate_duration("   "), 0.0);
    }

    #[tokio::test]
    async fn test_failed_scenes_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut storyboard = fixtures::storyboard();
        storyboard.scenes[0].voiceover_script = "Tired of slow dashboards?".into();
        storyboard.scenes[1].voiceover_script = "this will fail".into();

        let clips = generate_voiceovers(&FakeSynth, &storyboard, dir.path()).await;
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].filename, "voiceover_scene_1.mp3");
        let written = std::fs::read(dir.path().join("voiceover_scene_1.mp3")).unwrap();
        assert_eq!(written, b"mp3:Tired of slow dashboards?");
        assert!(!dir.path().join("voiceover_scene_2.mp3").exists());
    }

    #[tokio::test]
    async fn test_background_music_copy() {
        let library = tempfile::tempdir().unwrap();
        let public = tempfile::tempdir().unwrap();
        std::fs::write(library.path().join("background_calm.mp3"), b"calm").unwrap();

        let music = prepare_background_music(Some(library.path()), "calm", public.path()).await;
        assert_eq!(music.as_deref(), Some(MUSIC_FILE_NAME));
        assert_eq!(std::fs::read(public.path().join(MUSIC_FILE_NAME)).unwrap(), b"calm");

        assert_eq!(prepare_background_music(Some(library.path()), "none", public.path()).await, None);
        assert_eq!(prepare_background_music(Some(library.path()), "dramatic", public.path()).await, None);
        assert_eq!(prepare_background_music(None, "calm", public.path()).await, None);
    }
}
