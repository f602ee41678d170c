use std::{collections::BTreeMap, fs, path::Path, path::PathBuf};

use serde::Deserialize;

use crate::{Error, Result};

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Directory relative module paths (keys, body store) resolve against.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Host name of this server, used by modules that need one.
    #[serde(default)]
    pub hostname: Option<String>,

    /// Module instances by instance name.
    #[serde(default)]
    pub modules: BTreeMap<String, ModuleConfig>,
}

/// One `[modules.<name>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct ModuleConfig {
    /// Registered module name, e.g. `sign_dkim` or `sql`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Inline arguments, e.g. `["example.org", "default"]` for `sign_dkim`.
    #[serde(default)]
    pub args: Vec<String>,

    /// All remaining keys, handed to the module as its options.
    #[serde(flatten)]
    pub options: toml::Table,
}

impl ModuleConfig {
    /// Deserializes the module options into the module's own config type.
    pub fn options_as<T: for<'de> Deserialize<'de>>(&self, instance_name: &str) -> Result<T> {
        toml::Value::Table(self.options.clone())
            .try_into()
            .map_err(|e: toml::de::Error| {
                Error::configuration(format!("{} {instance_name}: {e}", self.kind))
            })
    }
}

/// Parses configuration from a TOML string.
pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

/// Loads configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path).map_err(|e| {
        Error::configuration(format!("failed to read {}: {e}", path.display()))
    })?;
    parse_config(&content)
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/mailstage")
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::{dkim::DkimConfig, ErrorKind};

    #[test]
    fn test_parse_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/mailstage"));
        assert!(config.hostname.is_none());
        assert!(config.modules.is_empty());
    }

    #[test]
    fn test_parse_modules() {
        let toml = r#"
state_dir = "/tmp/state"
hostname = "mx.example.org"

[modules.sign]
type = "sign_dkim"
args = ["example.org", "default"]
header_canon = "simple"
oversign_fields = ["Subject"]

[modules.local_mailboxes]
type = "sql"
driver = "memory"
dsn = "mail"
appendlimit = "64M"
"#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("mx.example.org"));
        assert_eq!(config.modules.len(), 2);

        let sign = &config.modules["sign"];
        assert_eq!(sign.kind, "sign_dkim");
        assert_eq!(sign.args, vec!["example.org", "default"]);
        assert!(!sign.options.contains_key("type"));
        assert!(!sign.options.contains_key("args"));

        let dkim: DkimConfig = sign.options_as("sign").unwrap();
        assert_eq!(dkim.oversign_fields, vec!["Subject"]);

        let sql = &config.modules["local_mailboxes"];
        assert_eq!(sql.kind, "sql");
        assert!(sql.args.is_empty());
        assert_eq!(sql.options["driver"].as_str(), Some("memory"));
    }

    #[test]
    fn test_options_error_names_instance() {
        let config = parse_config(
            r#"
[modules.sign]
type = "sign_dkim"
body_canon = "nofws"
"#,
        )
        .unwrap();
        let error = config.modules["sign"]
            .options_as::<DkimConfig>("sign")
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
        assert!(error.message().starts_with("sign_dkim sign:"));
    }

    #[test]
    fn test_missing_type_is_error() {
        let error = parse_config("[modules.sign]\ndomain = \"example.org\"\n").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_load_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mailstage.toml");
        fs::write(&path, "hostname = \"mx.example.org\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.hostname.as_deref(), Some("mx.example.org"));

        let error = load_config(&temp_dir.path().join("missing.toml")).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Configuration);
    }
}
