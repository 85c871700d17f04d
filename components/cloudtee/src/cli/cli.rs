use crate::helpers::load_config::{CloudwatchConfig, Config, S3Config};
use crate::runtime;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "cloudtee",
    about = "A tee command-like tool with AWS as the output destination",
    long_about = "cloudtee copies standard input to standard output and, at the same time, \
    uploads it to an S3 object and/or appends it line by line to a CloudWatch Logs stream.",
    version,
    term_width = 100,
    after_help = "\
    EXAMPLES:
        ./job.sh | cloudtee --s3-url-prefix s3://bucket/logs/ job.log
        ./job.sh | cloudtee --config ./cloudtee.yaml --log-group-name /jobs/nightly job.log"
)]
pub struct Args {
    /// Configuration file (YAML or TOML), layered over ~/.config/cloudtee/default.yaml
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Diagnostic log level (diagnostics are written to stderr)
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    pub log_level: String,

    /// Ignore interrupt signals instead of ending the input
    #[arg(short = 'i', long)]
    pub ignore_interrupt: bool,

    /// Exit if an error occurs during initialization
    #[arg(short = 'x', long)]
    pub exit_on_error: bool,

    /// AWS region
    #[arg(long, value_name = "REGION")]
    pub aws_region: Option<String>,

    /// Destination S3 URL prefix, e.g. s3://bucket/prefix/
    #[arg(long, value_name = "URL")]
    pub s3_url_prefix: Option<String>,

    /// Allow overwriting if the S3 object already exists
    #[arg(long)]
    pub s3_allow_overwrite: bool,

    /// Put an empty object first, e.g. for permission checks
    #[arg(long)]
    pub s3_firstly_put_empty_object: bool,

    /// Destination CloudWatch Logs log group name
    #[arg(long, value_name = "NAME")]
    pub log_group_name: Option<String>,

    /// CloudWatch Logs flush interval, e.g. 5s
    #[arg(long, value_name = "DURATION")]
    pub flush_interval: Option<String>,

    /// Lines buffered before a CloudWatch Logs flush
    #[arg(long, value_name = "LINES")]
    pub buffer_lines: Option<usize>,

    /// Create the CloudWatch Logs log group if it does not exist
    #[arg(long)]
    pub create_log_group: bool,

    /// Output name: S3 key suffix and CloudWatch Logs stream name
    #[arg(value_name = "OUTPUT_NAME")]
    pub output_name: Option<String>,
}

impl Args {
    /// Configuration files to load, lowest precedence first.
    pub fn config_paths(&self) -> Vec<PathBuf> {
        let mut paths = Config::default_paths();
        paths.extend(self.config.iter().cloned());
        paths
    }

    /// Patch `config` with the flags that were given. Boolean flags can only
    /// switch a setting on.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(region) = &self.aws_region {
            config.aws_region = Some(region.clone());
        }

        if self.s3_url_prefix.is_some() || self.s3_allow_overwrite || self.s3_firstly_put_empty_object
        {
            let s3 = config.s3.get_or_insert_with(S3Config::default);
            if let Some(prefix) = &self.s3_url_prefix {
                s3.url_prefix = prefix.clone();
            }
            s3.allow_overwrite |= self.s3_allow_overwrite;
            s3.firstly_put_empty_object |= self.s3_firstly_put_empty_object;
        }

        if self.log_group_name.is_some()
            || self.flush_interval.is_some()
            || self.buffer_lines.is_some()
            || self.create_log_group
        {
            let cloudwatch = config
                .cloudwatch
                .get_or_insert_with(CloudwatchConfig::default);
            if let Some(group) = &self.log_group_name {
                cloudwatch.log_group = group.clone();
            }
            if let Some(interval) = &self.flush_interval {
                cloudwatch.flush_interval = Some(interval.clone());
            }
            if let Some(lines) = self.buffer_lines {
                cloudwatch.buffer_lines = Some(lines);
            }
            cloudwatch.create_log_group |= self.create_log_group;
        }
    }
}

/// Entry function for CLI
pub async fn run(args: Args) -> Result<()> {
    runtime::runtime::run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse() {
        let args = Args::try_parse_from([
            "cloudtee",
            "-i",
            "-x",
            "--s3-url-prefix",
            "s3://bucket/prefix/",
            "--log-group-name",
            "/g",
            "--buffer-lines",
            "10",
            "out.log",
        ])
        .unwrap();
        assert!(args.ignore_interrupt);
        assert!(args.exit_on_error);
        assert_eq!(args.log_level, "info");
        assert_eq!(args.buffer_lines, Some(10));
        assert_eq!(args.output_name.as_deref(), Some("out.log"));
    }

    #[test]
    fn flags_override_only_what_they_name() {
        let mut config = Config {
            cloudwatch: Some(CloudwatchConfig {
                log_group: "/from-file".to_string(),
                flush_interval: Some("10s".to_string()),
                create_log_group: true,
                ..CloudwatchConfig::default()
            }),
            ..Config::default()
        };
        let args = Args {
            buffer_lines: Some(7),
            s3_url_prefix: Some("s3://bucket/".to_string()),
            ..Args::default()
        };
        args.apply_overrides(&mut config);

        let cloudwatch = config.cloudwatch.as_ref().unwrap();
        assert_eq!(cloudwatch.log_group, "/from-file");
        assert_eq!(cloudwatch.flush_interval.as_deref(), Some("10s"));
        assert_eq!(cloudwatch.buffer_lines, Some(7));
        assert!(cloudwatch.create_log_group);
        assert_eq!(config.s3.as_ref().unwrap().url_prefix, "s3://bucket/");
        assert!(!config.s3.as_ref().unwrap().allow_overwrite);
    }
}
