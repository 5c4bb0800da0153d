use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How preview status is reported back on a pull request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConversationMode {
    #[default]
    SingleComment,
    MultipleComments,
}

/// Repository-level preview configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationFile {
    pub docker_compose_yml_file_paths: Vec<String>,
    pub build_arguments: BTreeMap<String, String>,
    pub conversation_mode: ConversationMode,
    #[serde(with = "duration_seconds")]
    pub expiry: Duration,
    pub is_lazy: bool,
}

/// Per-pull-request overrides. Only fields that are set replace the base configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigurationFileOverride {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_arguments: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_mode: Option<ConversationMode>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "optional_duration_seconds"
    )]
    pub expiry: Option<Duration>,
}

impl ConfigurationFile {
    /// Applies an override. An overridden configuration is never lazy.
    #[must_use]
    pub fn with_override(mut self, configuration_override: &ConfigurationFileOverride) -> Self {
        self.is_lazy = false;

        if let Some(build_arguments) = &configuration_override.build_arguments {
            self.build_arguments.clone_from(build_arguments);
        }

        if let Some(conversation_mode) = configuration_override.conversation_mode {
            self.conversation_mode = conversation_mode;
        }

        if let Some(expiry) = configuration_override.expiry.filter(|value| !value.is_zero()) {
            self.expiry = expiry;
        }

        self
    }
}

mod duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod optional_duration_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|value| value.map(Duration::from_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConfigurationFile {
        ConfigurationFile {
            docker_compose_yml_file_paths: vec!["docker-compose.yml".to_string()],
            build_arguments: BTreeMap::from([("FOO".to_string(), "base".to_string())]),
            conversation_mode: ConversationMode::SingleComment,
            expiry: Duration::from_secs(3600),
            is_lazy: true,
        }
    }

    #[test]
    fn empty_override_only_clears_lazy_flag() {
        let configuration = base().with_override(&ConfigurationFileOverride::default());

        assert!(!configuration.is_lazy);
        assert_eq!(configuration.build_arguments, base().build_arguments);
        assert_eq!(configuration.expiry, Duration::from_secs(3600));
        assert_eq!(configuration.conversation_mode, ConversationMode::SingleComment);
    }

    #[test]
    fn set_fields_replace_base_values() {
        let configuration = base().with_override(&ConfigurationFileOverride {
            build_arguments: Some(BTreeMap::from([("BAR".to_string(), "x".to_string())])),
            conversation_mode: Some(ConversationMode::MultipleComments),
            expiry: Some(Duration::from_secs(60)),
        });

        assert_eq!(
            configuration.build_arguments,
            BTreeMap::from([("BAR".to_string(), "x".to_string())])
        );
        assert_eq!(
            configuration.conversation_mode,
            ConversationMode::MultipleComments
        );
        assert_eq!(configuration.expiry, Duration::from_secs(60));
        assert_eq!(
            configuration.docker_compose_yml_file_paths,
            vec!["docker-compose.yml".to_string()]
        );
    }

    #[test]
    fn zero_expiry_override_is_ignored() {
        let configuration = base().with_override(&ConfigurationFileOverride {
            expiry: Some(Duration::ZERO),
            ..ConfigurationFileOverride::default()
        });

        assert_eq!(configuration.expiry, Duration::from_secs(3600));
    }

    #[test]
    fn override_json_omits_unset_fields() {
        let json = serde_json::to_string(&ConfigurationFileOverride {
            expiry: Some(Duration::from_secs(120)),
            ..ConfigurationFileOverride::default()
        })
        .expect("serialize");
        assert_eq!(json, r#"{"expiry":120}"#);

        let parsed: ConfigurationFileOverride = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.expiry, Some(Duration::from_secs(120)));
        assert!(parsed.build_arguments.is_none());
    }
}
