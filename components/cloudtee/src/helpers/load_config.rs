//! Configuration loading and validation.
//!
//! `Config` mirrors the YAML/TOML file as written by the user. It is loaded in
//! layers (default file, explicit file, `CLOUDTEE__*` environment variables),
//! patched by command-line flags, and finally validated into [`Settings`],
//! which is what the rest of the crate consumes.

// External crates
use config::{Environment, File, Map};
use semver::{Version, VersionReq};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::instrument;
use url::Url;

/// Flush interval used when none is configured.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Buffered line count used when none (or zero) is configured.
pub const DEFAULT_BUFFER_LINES: usize = 50;

const ENV_PREFIX: &str = "CLOUDTEE";
const DEFAULT_CONFIG_STEM: &str = ".config/cloudtee/default";

/// Configuration load and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or deserialized.
    #[error("config load: {0}")]
    Load(#[from] config::ConfigError),

    /// `s3.url_prefix` is not a URL.
    #[error("s3 url_prefix is invalid format: {0}")]
    InvalidUrlPrefix(#[source] url::ParseError),

    /// `s3.url_prefix` does not use the `s3` scheme.
    #[error("s3 url_prefix schema is not `s3`: schema is `{0}`")]
    SchemeMismatch(String),

    /// CloudWatch Logs settings were given without a log group.
    #[error("cloudwatch log_group is required")]
    MissingLogGroup,

    /// `cloudwatch.flush_interval` is not a duration.
    #[error("cloudwatch flush_interval is invalid format")]
    InvalidFlushInterval(#[source] humantime::DurationError),

    /// `required_version` is not a version requirement.
    #[error("required_version has invalid format: {0}")]
    InvalidRequiredVersion(#[source] semver::Error),

    /// This binary is outside `required_version`.
    #[error("version {version} does not satisfy constraints required_version: {required}")]
    UnsatisfiedVersion {
        /// Version of the running binary.
        version: String,
        /// Requirement it failed.
        required: VersionReq,
    },
}

/// Configuration as read from files and the environment, before validation.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    /// Semver requirement the binary must satisfy, e.g. `>=0.1.0`.
    pub required_version: Option<String>,
    /// Region for both AWS clients; `AWS_REGION` when unset.
    pub aws_region: Option<String>,
    /// Object destination section.
    pub s3: Option<S3Config>,
    /// Log destination section.
    pub cloudwatch: Option<CloudwatchConfig>,
}

/// `s3` section. The destination is enabled when `url_prefix` is set.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct S3Config {
    /// `s3://bucket/prefix`; the output name is appended to it.
    pub url_prefix: String,
    /// Replace an existing object instead of failing.
    pub allow_overwrite: bool,
    /// Put an empty object before uploading, to check permissions early.
    pub firstly_put_empty_object: bool,
}

/// `cloudwatch` section. The destination is enabled when `log_group` is set.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CloudwatchConfig {
    /// Target log group.
    pub log_group: String,
    /// Humantime duration between interval flushes, e.g. `5s`.
    pub flush_interval: Option<String>,
    /// Lines that trigger a flush.
    pub buffer_lines: Option<usize>,
    /// Create the log group when it is missing.
    pub create_log_group: bool,
}

impl Config {
    /// Load `paths` in order, later files overriding earlier ones, then apply
    /// `CLOUDTEE__SECTION__KEY` environment variables.
    pub fn load_layered(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        Self::load_with_env(paths, None)
    }

    #[instrument(
        name = "cloudtee_config::load",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    fn load_with_env(
        paths: &[PathBuf],
        env: Option<Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        for path in paths {
            tracing::trace!(configuration_file_path = %path.display(), "Adding configuration file");
            builder = builder.add_source(File::from(path.as_path()).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Config = match builder.build().and_then(|c| c.try_deserialize()) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load configuration");
                return Err(e.into());
            }
        };
        tracing::trace!("Configuration loaded successfully");
        Ok(config)
    }

    /// `~/.config/cloudtee/default.yaml` and `.yml`, those that exist.
    pub fn default_paths() -> Vec<PathBuf> {
        let Some(home) = dirs::home_dir() else {
            return Vec::new();
        };
        ["yaml", "yml"]
            .iter()
            .map(|ext| home.join(format!("{DEFAULT_CONFIG_STEM}.{ext}")))
            .filter(|path| path.is_file())
            .collect()
    }

    /// True when the object destination is configured.
    pub fn enable_s3(&self) -> bool {
        self.s3.as_ref().is_some_and(|s3| !s3.url_prefix.is_empty())
    }

    /// True when the log destination is configured.
    pub fn enable_cloudwatch(&self) -> bool {
        self.cloudwatch
            .as_ref()
            .is_some_and(|cw| !cw.log_group.is_empty())
    }

    /// Validate the configuration. Destinations without their key setting
    /// (`url_prefix`, `log_group`) are disabled rather than rejected.
    pub fn restrict(&self) -> Result<Settings, ConfigError> {
        let required_version = match self.required_version.as_deref() {
            Some(req) if !req.trim().is_empty() => {
                Some(VersionReq::parse(req).map_err(ConfigError::InvalidRequiredVersion)?)
            }
            _ => None,
        };

        let s3 = match &self.s3 {
            Some(s3) if self.enable_s3() => Some(s3.restrict()?),
            _ => None,
        };
        let cloudwatch = match &self.cloudwatch {
            Some(cw) if self.enable_cloudwatch() => Some(cw.restrict()?),
            _ => None,
        };

        let aws_region = self
            .aws_region
            .clone()
            .filter(|r| !r.is_empty())
            .or_else(|| std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()));

        Ok(Settings {
            aws_region,
            s3,
            cloudwatch,
            required_version,
        })
    }
}

impl S3Config {
    /// Parse and validate the section.
    pub fn restrict(&self) -> Result<S3Settings, ConfigError> {
        let mut settings = S3Settings::parse(&self.url_prefix)?;
        settings.allow_overwrite = self.allow_overwrite;
        settings.firstly_put_empty_object = self.firstly_put_empty_object;
        Ok(settings)
    }
}

impl CloudwatchConfig {
    /// Validate the section and fill in defaults.
    pub fn restrict(&self) -> Result<CloudwatchSettings, ConfigError> {
        if self.log_group.is_empty() {
            return Err(ConfigError::MissingLogGroup);
        }
        let flush_interval = match self.flush_interval.as_deref() {
            None | Some("") => DEFAULT_FLUSH_INTERVAL,
            Some(raw) => {
                humantime::parse_duration(raw).map_err(ConfigError::InvalidFlushInterval)?
            }
        };
        let buffer_lines = match self.buffer_lines {
            None | Some(0) => DEFAULT_BUFFER_LINES,
            Some(lines) => lines,
        };
        Ok(CloudwatchSettings {
            log_group: self.log_group.clone(),
            flush_interval,
            buffer_lines,
            create_log_group: self.create_log_group,
        })
    }
}

/// Validated configuration.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// Region for both AWS clients, if known.
    pub aws_region: Option<String>,
    /// Object destination, when enabled.
    pub s3: Option<S3Settings>,
    /// Log destination, when enabled.
    pub cloudwatch: Option<CloudwatchSettings>,
    /// Requirement checked by [`Settings::validate_version`].
    pub required_version: Option<VersionReq>,
}

impl Settings {
    /// Check `version` against `required_version`.
    ///
    /// Versions that cannot be parsed (development builds) always pass.
    pub fn validate_version(&self, version: &str) -> Result<(), ConfigError> {
        let Some(required) = &self.required_version else {
            return Ok(());
        };
        let core = version.split('-').next().unwrap_or(version);
        let Ok(parsed) = Version::parse(core) else {
            tracing::warn!(version, "Invalid version format, skip checking required_version");
            return Ok(());
        };
        if !required.matches(&parsed) {
            return Err(ConfigError::UnsatisfiedVersion {
                version: version.to_string(),
                required: required.clone(),
            });
        }
        Ok(())
    }
}

/// Validated object destination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    /// The parsed `url_prefix`.
    pub url_prefix: Url,
    /// Host part of the prefix.
    pub bucket: String,
    /// Path part of the prefix, leading `/` included.
    pub prefix: String,
    /// See [`S3Config::allow_overwrite`].
    pub allow_overwrite: bool,
    /// See [`S3Config::firstly_put_empty_object`].
    pub firstly_put_empty_object: bool,
}

impl S3Settings {
    /// Parse an `s3://bucket/prefix` URL with overwrite disabled.
    pub fn parse(url_prefix: &str) -> Result<Self, ConfigError> {
        let url = match Url::parse(url_prefix) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Err(ConfigError::SchemeMismatch(String::new()));
            }
            Err(e) => return Err(ConfigError::InvalidUrlPrefix(e)),
        };
        if url.scheme() != "s3" {
            return Err(ConfigError::SchemeMismatch(url.scheme().to_string()));
        }
        Ok(Self {
            bucket: url.host_str().unwrap_or_default().to_string(),
            prefix: url.path().to_string(),
            url_prefix: url,
            allow_overwrite: false,
            firstly_put_empty_object: false,
        })
    }
}

/// Validated log destination settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudwatchSettings {
    /// Target log group.
    pub log_group: String,
    /// Time between interval flushes.
    pub flush_interval: Duration,
    /// Lines that trigger a flush, at least one.
    pub buffer_lines: usize,
    /// Create the log group when it is missing.
    pub create_log_group: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(suffix: &str, body: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    fn no_env() -> Option<Map<String, String>> {
        Some(Map::new())
    }

    #[test]
    fn yaml_file_is_loaded_and_restricted() {
        let file = config_file(
            ".yaml",
            r#"
required_version: ">=0.1.0"
aws_region: ap-northeast-1
s3:
  url_prefix: s3://bucket/prefix/
  allow_overwrite: true
cloudwatch:
  log_group: /cloudtee/app
  flush_interval: 1m 30s
  buffer_lines: 100
"#,
        );
        let config = Config::load_with_env(&[file.path().to_path_buf()], no_env()).unwrap();
        let settings = config.restrict().unwrap();

        assert_eq!(settings.aws_region.as_deref(), Some("ap-northeast-1"));
        let s3 = settings.s3.as_ref().unwrap();
        assert_eq!(s3.bucket, "bucket");
        assert_eq!(s3.prefix, "/prefix/");
        assert!(s3.allow_overwrite);
        assert!(!s3.firstly_put_empty_object);

        let cw = settings.cloudwatch.as_ref().unwrap();
        assert_eq!(cw.log_group, "/cloudtee/app");
        assert_eq!(cw.flush_interval, Duration::from_secs(90));
        assert_eq!(cw.buffer_lines, 100);
        assert!(!cw.create_log_group);

        settings.validate_version("0.2.0").unwrap();
    }

    #[test]
    fn later_layers_and_environment_win() {
        let base = config_file(
            ".yaml",
            "cloudwatch:\n  log_group: /base\n  buffer_lines: 10\n",
        );
        let overlay = config_file(".toml", "[cloudwatch]\nlog_group = \"/overlay\"\n");
        let mut env = Map::new();
        env.insert(
            "CLOUDTEE__CLOUDWATCH__BUFFER_LINES".to_string(),
            "20".to_string(),
        );

        let config = Config::load_with_env(
            &[base.path().to_path_buf(), overlay.path().to_path_buf()],
            Some(env),
        )
        .unwrap();
        let cw = config.restrict().unwrap().cloudwatch.unwrap();
        assert_eq!(cw.log_group, "/overlay");
        assert_eq!(cw.buffer_lines, 20);
    }

    #[test]
    fn defaults_apply_and_empty_sections_disable_destinations() {
        let config = Config {
            s3: Some(S3Config::default()),
            cloudwatch: Some(CloudwatchConfig {
                log_group: "/g".to_string(),
                buffer_lines: Some(0),
                ..CloudwatchConfig::default()
            }),
            ..Config::default()
        };
        assert!(!config.enable_s3());
        let settings = config.restrict().unwrap();
        assert!(settings.s3.is_none());
        let cw = settings.cloudwatch.unwrap();
        assert_eq!(cw.flush_interval, DEFAULT_FLUSH_INTERVAL);
        assert_eq!(cw.buffer_lines, DEFAULT_BUFFER_LINES);
    }

    #[test]
    fn invalid_values_are_rejected_with_readable_messages() {
        let err = S3Settings::parse("https://bucket/prefix").unwrap_err();
        assert_eq!(
            err.to_string(),
            "s3 url_prefix schema is not `s3`: schema is `https`"
        );
        let err = S3Settings::parse("bucket/prefix").unwrap_err();
        assert_eq!(err.to_string(), "s3 url_prefix schema is not `s3`: schema is ``");

        let err = CloudwatchConfig {
            log_group: "/g".to_string(),
            flush_interval: Some("soon".to_string()),
            ..CloudwatchConfig::default()
        }
        .restrict()
        .unwrap_err();
        assert_eq!(err.to_string(), "cloudwatch flush_interval is invalid format");

        let err = CloudwatchConfig::default().restrict().unwrap_err();
        assert_eq!(err.to_string(), "cloudwatch log_group is required");

        let config = Config {
            required_version: Some("not a constraint".to_string()),
            ..Config::default()
        };
        assert!(matches!(
            config.restrict(),
            Err(ConfigError::InvalidRequiredVersion(_))
        ));
    }

    #[test]
    fn required_version_is_enforced() {
        let settings = Config {
            required_version: Some(">=1.2.0, <2.0.0".to_string()),
            ..Config::default()
        }
        .restrict()
        .unwrap();

        settings.validate_version("1.4.0").unwrap();
        settings.validate_version("1.2.0-rc.1").unwrap();
        settings.validate_version("current").unwrap();
        let err = settings.validate_version("0.9.0").unwrap_err();
        assert!(
            err.to_string()
                .starts_with("version 0.9.0 does not satisfy constraints required_version")
        );
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let err = Config::load_with_env(&[PathBuf::from("/nonexistent/cloudtee.yaml")], no_env())
            .unwrap_err();
        assert!(err.to_string().starts_with("config load: "));
    }
}
