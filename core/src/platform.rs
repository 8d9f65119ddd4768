use std::fmt;

use url::Url;

/// Model hubs that downloads can authenticate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Civitai,
    HuggingFace,
}

pub const PLATFORMS: &[Platform] = &[Platform::Civitai, Platform::HuggingFace];

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Civitai => "civitai",
            Platform::HuggingFace => "huggingface",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "civitai" => Some(Platform::Civitai),
            "huggingface" => Some(Platform::HuggingFace),
            _ => None,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn detect_platform(url: &str) -> Option<Platform> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();

    if host == "civitai.com" || host.ends_with(".civitai.com") {
        return Some(Platform::Civitai);
    }
    if host == "huggingface.co" || host.ends_with(".huggingface.co") || host == "hf.co" {
        return Some(Platform::HuggingFace);
    }
    None
}

pub fn is_html_content_type(content_type: Option<&str>) -> bool {
    let Some(value) = content_type else {
        return false;
    };
    let value = value.to_ascii_lowercase();
    value.contains("text/html") || value.contains("application/xhtml")
}
