use crate::export::StatusColumn;
use crate::reconcile::{CorrectionMode, ReconcilePolicy, ToleranceMode};
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default)]
    pub vision: VisionSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub export: ExportSection,
}

fn default_db_path() -> String {
    "sheetstore/sheets.db".to_string()
}

/// Which chat-completions endpoint the recognizer talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisionBackend {
    /// Local Ollama server.
    #[default]
    Ollama,
    /// CLIProxyAPI gateway (OAuth handled by the proxy, no key).
    Cliproxy,
    /// Hosted API, key from the VISION_API_KEY env var.
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VisionSection {
    #[serde(default)]
    pub backend: VisionBackend,
    #[serde(default = "default_ollama_endpoint")]
    pub ollama: EndpointSection,
    #[serde(default = "default_cliproxy_endpoint")]
    pub cliproxy: EndpointSection,
    #[serde(default = "default_remote_endpoint")]
    pub remote: EndpointSection,
}

impl Default for VisionSection {
    fn default() -> Self {
        VisionSection {
            backend: VisionBackend::default(),
            ollama: default_ollama_endpoint(),
            cliproxy: default_cliproxy_endpoint(),
            remote: default_remote_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointSection {
    pub base_url: String,
    pub model: String,
}

fn default_ollama_endpoint() -> EndpointSection {
    EndpointSection {
        base_url: "http://localhost:11434/v1".to_string(),
        model: "qwen2.5vl:7b".to_string(),
    }
}

fn default_cliproxy_endpoint() -> EndpointSection {
    EndpointSection {
        base_url: "http://localhost:8317/v1".to_string(),
        model: "gemini-2.5-flash".to_string(),
    }
}

fn default_remote_endpoint() -> EndpointSection {
    EndpointSection {
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o-mini".to_string(),
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ReconcileSection {
    #[serde(default)]
    pub tolerance: ToleranceMode,
    #[serde(default)]
    pub correction: CorrectionMode,
}

impl ReconcileSection {
    pub fn policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            tolerance: self.tolerance,
            correction: self.correction,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportSection {
    #[serde(default = "default_out_dir")]
    pub out_dir: String,
    #[serde(default)]
    pub status_column: StatusColumn,
}

impl Default for ExportSection {
    fn default() -> Self {
        ExportSection {
            out_dir: default_out_dir(),
            status_column: StatusColumn::default(),
        }
    }
}

fn default_out_dir() -> String {
    "exports".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_path: default_db_path(),
            vision: VisionSection::default(),
            reconcile: ReconcileSection::default(),
            export: ExportSection::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.db_path, "sheetstore/sheets.db");
        assert_eq!(cfg.vision.backend, VisionBackend::Ollama);
        assert_eq!(cfg.export.out_dir, "exports");
    }

    #[test]
    fn test_policy_sections_parse() {
        let cfg: Config = toml::from_str(
            r#"
            [vision]
            backend = "remote"

            [reconcile]
            tolerance = "rounded"
            correction = "force"

            [export]
            status_column = "last"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.vision.backend, VisionBackend::Remote);
        assert_eq!(cfg.reconcile.tolerance, ToleranceMode::Rounded);
        assert_eq!(cfg.reconcile.correction, CorrectionMode::Force);
        assert_eq!(cfg.export.status_column, StatusColumn::Last);
    }
}
