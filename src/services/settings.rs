use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::providers::ProviderFamily;

/// Process-wide provider credentials. A per-request override always takes
/// precedence over these (see the router's credential resolution).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub google_api_key: Option<String>,
}

impl ProviderCredentials {
    pub fn get(&self, family: ProviderFamily) -> Option<&str> {
        match family {
            ProviderFamily::OpenAi => self.openai_api_key.as_deref(),
            ProviderFamily::Anthropic => self.anthropic_api_key.as_deref(),
            ProviderFamily::Google => self.google_api_key.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorScheme {
    System,
    Light,
    Dark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThemeConfig {
    pub color_scheme: ColorScheme,
    pub message_font_size: u32,
    pub code_font_size: u32,
}

impl Default for ThemeConfig {
    fn default() -> Self {
        Self {
            color_scheme: ColorScheme::System,
            message_font_size: 14,
            code_font_size: 13,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresetPrompt {
    pub name: String,
    pub prompt: String,
}

/// Settings live outside the conversation domain: created once with static
/// defaults, overwritten by user actions, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Global system prompt; a conversation-level prompt overrides it.
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub theme: ThemeConfig,
    #[serde(default)]
    pub preset_prompts: Vec<PresetPrompt>,
    #[serde(default)]
    pub credentials: ProviderCredentials,
}

fn default_temperature() -> f32 {
    1.0
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            temperature: default_temperature(),
            theme: ThemeConfig::default(),
            preset_prompts: Vec::new(),
            credentials: ProviderCredentials::default(),
        }
    }
}

pub struct SettingsService;

impl SettingsService {
    pub async fn load(path: &Path) -> AppSettings {
        match tokio::fs::read_to_string(path).await {
            Ok(json) => serde_json::from_str(&json).unwrap_or_default(),
            Err(_) => AppSettings::default(),
        }
    }

    pub async fn save(path: &Path, settings: &AppSettings) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(settings)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}
