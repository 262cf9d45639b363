use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettings {
    pub provider: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub streaming_enabled: bool,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            provider: "openai".into(),
            model: "gpt-3.5-turbo".into(),
            temperature: 0.7,
            max_tokens: 4096,
            streaming_enabled: true,
        }
    }
}

/// Partial update; `None` fields leave the current value in place.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChatSettingsPatch {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub streaming_enabled: Option<bool>,
}

impl ChatSettings {
    pub fn apply_patch(&mut self, patch: ChatSettingsPatch) {
        if let Some(v) = patch.provider { self.provider = v; }
        if let Some(v) = patch.model { self.model = v; }
        if let Some(v) = patch.temperature { self.temperature = v; }
        if let Some(v) = patch.max_tokens { self.max_tokens = v; }
        if let Some(v) = patch.streaming_enabled { self.streaming_enabled = v; }
    }
}

impl ChatSettingsPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Folds `key=value` into the patch. Keys are accepted in camelCase or
    /// snake_case.
    pub fn assign(&mut self, assignment: &str) -> anyhow::Result<()> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("expected key=value, got '{}'", assignment))?;
        let value = value.trim();
        match key.trim() {
            "provider" => self.provider = Some(value.to_string()),
            "model" => self.model = Some(value.to_string()),
            "temperature" => self.temperature = Some(value.parse().map_err(|_| anyhow::anyhow!("temperature must be a number"))?),
            "maxTokens" | "max_tokens" => self.max_tokens = Some(value.parse().map_err(|_| anyhow::anyhow!("maxTokens must be a non-negative integer"))?),
            "streamingEnabled" | "streaming_enabled" | "stream" => self.streaming_enabled = Some(parse_bool(value)?),
            other => anyhow::bail!("unknown setting '{}'", other),
        }
        Ok(())
    }

    pub fn from_assignments<I, S>(assignments: I) -> anyhow::Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patch = Self::default();
        for a in assignments {
            patch.assign(a.as_ref())?;
        }
        Ok(patch)
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "yes" | "1" => Ok(true),
        "false" | "off" | "no" | "0" => Ok(false),
        _ => anyhow::bail!("expected a boolean, got '{}'", value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merges_only_present_fields() {
        let mut settings = ChatSettings::default();
        settings.apply_patch(ChatSettingsPatch {
            model: Some("gpt-4".into()),
            streaming_enabled: Some(false),
            ..Default::default()
        });

        assert_eq!(settings.model, "gpt-4");
        assert!(!settings.streaming_enabled);
        assert_eq!(settings.provider, "openai"); // untouched
        assert_eq!(settings.max_tokens, 4096); // untouched
        assert_eq!(settings.temperature, 0.7);
    }

    #[test]
    fn assignments_accept_both_key_styles() {
        let patch = ChatSettingsPatch::from_assignments(["max_tokens=128", "streamingEnabled=off", "temperature=0.2"]).unwrap();
        assert_eq!(patch.max_tokens, Some(128));
        assert_eq!(patch.streaming_enabled, Some(false));
        assert_eq!(patch.temperature, Some(0.2));
        assert!(patch.model.is_none());
        assert!(!patch.is_empty());
    }

    #[test]
    fn bad_assignments_are_rejected() {
        assert!(ChatSettingsPatch::from_assignments(["model"]).is_err());
        assert!(ChatSettingsPatch::from_assignments(["colour=blue"]).is_err());
        assert!(ChatSettingsPatch::from_assignments(["maxTokens=-1"]).is_err());
        assert!(ChatSettingsPatch::from_assignments(["stream=maybe"]).is_err());
    }

    #[test]
    fn persisted_shape_is_camel_case() {
        let v = serde_json::to_value(ChatSettings::default()).unwrap();
        assert_eq!(v["maxTokens"], 4096);
        assert_eq!(v["streamingEnabled"], true);
    }
}
