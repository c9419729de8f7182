use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    pub bundle: BundleSettings,
    pub delta: DeltaSettings,
    #[serde(default)]
    pub output: OutputSettings,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BundleSettings {
    /// Check every payload CRC when the patch file is opened
    pub verify_checksums: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeltaSettings {
    /// Check VCDIFF window checksums after decoding
    pub verify_checksums: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OutputSettings {
    /// Output root offered when none is given on the command line
    pub directory: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bundle: BundleSettings::default(),
            delta: DeltaSettings::default(),
            output: OutputSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for BundleSettings {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

impl Default for DeltaSettings {
    fn default() -> Self {
        Self {
            verify_checksums: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();

        assert_eq!(settings.log_level, "info");
        assert!(settings.bundle.verify_checksums);
        assert!(settings.delta.verify_checksums);
        assert_eq!(settings.output.directory, None);
    }

    #[test]
    fn test_output_section_is_optional() {
        let settings: Settings = serde_json::from_str(
            r#"{
                "bundle": { "verify_checksums": true },
                "delta": { "verify_checksums": false },
                "log_level": "warn"
            }"#,
        )
        .unwrap();

        assert_eq!(settings.output.directory, None);
        assert!(!settings.delta.verify_checksums);
    }

    #[test]
    fn test_default_settings_snapshot() {
        let settings = Settings::default();
        insta::assert_yaml_snapshot!(settings);
    }
}
