//! Image downloads into a workspace's `public/` directory.
//!
//! Every asset reference resolves to *some* local file: anything that is not
//! a reachable PNG or JPEG is replaced with a 1x1 placeholder so a render
//! never fails on a missing image.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::adapters::DirectorOutput;
use crate::error::{PipelineError, PipelineResult};
use crate::orchestrator::is_public_host;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_IMAGE_BYTES: usize = 100;
pub const PLACEHOLDER_NAME: &str = "placeholder.png";

/// Minimal valid 1x1 gray PNG.
pub const PLACEHOLDER_PNG: &[u8] = &[
    0x89, 0x50, 0x4e, 0x47, 0x0d, 0x0a, 0x1a, 0x0a, 0x00, 0x00, 0x00, 0x0d, 0x49, 0x48, 0x44, 0x52,
    0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x02, 0x00, 0x00, 0x00, 0x90, 0x77, 0x53,
    0xde, 0x00, 0x00, 0x00, 0x0c, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9c, 0x63, 0x60, 0x00, 0x00, 0x00,
    0x02, 0x00, 0x01, 0x2e, 0x1b, 0xe0, 0x1c, 0x00, 0x00, 0x00, 0x00, 0x49, 0x45, 0x4e, 0x44, 0xae,
    0x42, 0x60, 0x82,
];

fn unsafe_chars() -> &'static Regex {
    static UNSAFE_CHARS: OnceLock<Regex> = OnceLock::new();
    UNSAFE_CHARS.get_or_init(|| Regex::new(r"[^A-Za-z0-9_.-]").expect("valid regex"))
}

pub fn sanitize_filename(name: &str) -> String {
    unsafe_chars().replace_all(name, "").into_owned()
}

/// Normalize protocol-relative URLs; `None` for anything that is not http(s).
pub fn normalize_url(src: &str) -> Option<String> {
    let src = src.trim();
    let src = match src.strip_prefix("//") {
        Some(rest) => format!("https://{}", rest),
        None => src.to_string(),
    };
    (src.starts_with("http://") || src.starts_with("https://")).then_some(src)
}

/// Local file name for an image URL: its sanitized basename, or a stable
/// hash-derived name when the path has no usable file name.
pub fn filename_for_url(url: &str) -> String {
    let basename = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|name| sanitize_filename(&name))
        .filter(|name| name.contains('.') && !name.starts_with('.'));

    basename.unwrap_or_else(|| {
        let digest = Sha256::digest(url.as_bytes());
        format!("asset_{}.png", &hex::encode(digest)[..12])
    })
}

/// File names written during one localization pass, mapped to the URL that
/// owns each of them.
#[derive(Debug, Default)]
struct ClaimedNames(HashMap<String, String>);

impl ClaimedNames {
    /// Local name for `url` that no other URL in this pass has taken. A
    /// basename already owned by a different URL gets a short URL hash.
    fn claim(&mut self, url: &str) -> String {
        let name = filename_for_url(url);
        match self.0.get(&name) {
            Some(owner) if owner != url => {
                let unique = with_url_hash(&name, url);
                self.0.insert(unique.clone(), url.to_string());
                unique
            }
            Some(_) => name,
            None => {
                self.0.insert(name.clone(), url.to_string());
                name
            }
        }
    }
}

fn with_url_hash(name: &str, url: &str) -> String {
    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    let short = &digest[..8];
    match name.rsplit_once('.') {
        Some((stem, ext)) => format!("{}_{}.{}", stem, short, ext),
        None => format!("{}_{}", name, short),
    }
}

/// Whether an asset URL may be fetched at all.
fn is_fetchable(url: &str) -> bool {
    url::Url::parse(url).map_or(false, |u| is_public_host(&u))
}

pub fn accept_image_bytes(bytes: &[u8]) -> bool {
    let is_png = bytes.starts_with(&[0x89, b'P', b'N', b'G']);
    let is_jpeg = bytes.starts_with(&[0xff, 0xd8]);
    bytes.len() > MIN_IMAGE_BYTES && (is_png || is_jpeg)
}

pub struct AssetFetcher {
    client: reqwest::Client,
}

impl Default for AssetFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl AssetFetcher {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(DOWNLOAD_TIMEOUT)
            .user_agent("Mozilla/5.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Image bytes for `url`, or the placeholder on any failure.
    async fn fetch_or_placeholder(&self, url: &str) -> Vec<u8> {
        let result = async {
            let resp = self.client.get(url).send().await?.error_for_status()?;
            resp.bytes().await
        }
        .await;

        match result {
            Ok(bytes) if accept_image_bytes(&bytes) => bytes.to_vec(),
            Ok(bytes) => {
                tracing::warn!(url = %url, len = bytes.len(), "Not a usable PNG/JPEG, using placeholder");
                PLACEHOLDER_PNG.to_vec()
            }
            Err(e) => {
                tracing::warn!(url = %url, "Image download failed, using placeholder: {}", e);
                PLACEHOLDER_PNG.to_vec()
            }
        }
    }

    /// Place the image referenced by `src` into `public_dir` and return its
    /// local file name. Only I/O errors writing the file are fatal.
    pub async fn localize(&self, src: &str, public_dir: &Path) -> PipelineResult<String> {
        self.localize_into(src, public_dir, &mut ClaimedNames::default()).await
    }

    async fn localize_into(
        &self,
        src: &str,
        public_dir: &Path,
        claimed: &mut ClaimedNames,
    ) -> PipelineResult<String> {
        let placeholder = || (PLACEHOLDER_NAME.to_string(), PLACEHOLDER_PNG.to_vec());
        let (name, bytes) = match normalize_url(src) {
            Some(url) if is_fetchable(&url) => (claimed.claim(&url), self.fetch_or_placeholder(&url).await),
            Some(url) => {
                tracing::warn!(url = %url, "Asset host is not public, using placeholder");
                placeholder()
            }
            None => {
                if !src.trim().is_empty() {
                    tracing::warn!(src = %src, "Invalid asset source, using placeholder");
                }
                placeholder()
            }
        };

        let path = public_dir.join(&name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| PipelineError::workspace(&format!("write asset {}", path.display()), e))?;
        Ok(name)
    }

    /// Download every URL, returning local names in input order, deduplicated.
    pub async fn download_all(&self, urls: &[String], public_dir: &Path) -> PipelineResult<Vec<String>> {
        let mut claimed = ClaimedNames::default();
        let mut names = Vec::with_capacity(urls.len());
        for url in urls {
            let name = self.localize_into(url, public_dir, &mut claimed).await?;
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Rewrite every screenshot `src` in the director plan to a local file.
    pub async fn localize_director_assets(
        &self,
        director: &mut DirectorOutput,
        public_dir: &Path,
    ) -> PipelineResult<()> {
        let mut claimed = ClaimedNames::default();
        for shot in &mut director.screenshots {
            shot.src = self.localize_into(&shot.src, public_dir, &mut claimed).await?;
        }
        Ok(())
    }
}
