use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use derive_more::{Display, Error, From};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{de, Deserialize, Deserializer};

#[cfg(feature = "logging")]
use tracing_subscriber::filter::LevelFilter;

/// Pattern used when no package name pattern was provided.
pub const MATCH_ALL_PATTERN: &str = ".*";

/// Configuration loading errors.
#[derive(Debug, Display, From, Error)]
pub enum ConfigError {
    /// Unable to load the configuration using [`figment`].
    Figment(figment::Error),

    /// Required input is present, but empty.
    #[display(fmt = "input required and not supplied: {}", _0)]
    #[from(ignore)]
    MissingInput(#[error(ignore)] &'static str),
}

/// Implementation of [`serde`]'s deserializer for [`FromStr`] types.
///
/// [`FromStr`]: std::str::FromStr
#[cfg(feature = "logging")]
fn deserialize_from_str<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error,
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    std::str::FromStr::from_str(&s).map_err(serde::de::Error::custom)
}

/// Scalar value as it may arrive from a config file or a CI input.
#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    /// Textual value.
    Text(String),

    /// Non-negative integer.
    Unsigned(u64),

    /// Negative integer.
    Signed(i64),

    /// Floating point number.
    Float(f64),

    /// Native boolean value.
    Bool(bool),
}

impl Scalar {
    /// Render the value as text.
    fn into_text(self) -> String {
        match self {
            Scalar::Text(text) => text,
            Scalar::Unsigned(value) => value.to_string(),
            Scalar::Signed(value) => value.to_string(),
            Scalar::Float(value) => value.to_string(),
            Scalar::Bool(value) => value.to_string(),
        }
    }
}

/// Accept any scalar as text, so that `12345` or `true` stay valid string inputs.
fn deserialize_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Scalar::deserialize(deserializer)?.into_text())
}

/// Optional variant of [`deserialize_text`].
fn deserialize_optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    deserialize_text(deserializer).map(Some)
}

/// Accept a number or its textual form, where an empty string means "not set".
fn deserialize_number<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: FromStr + TryFrom<u64>,
    <T as FromStr>::Err: fmt::Display,
    <T as TryFrom<u64>>::Error: fmt::Display,
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Unsigned(value) => T::try_from(value).map(Some).map_err(de::Error::custom),
        Scalar::Text(text) if text.trim().is_empty() => Ok(None),
        Scalar::Text(text) => text.trim().parse().map(Some).map_err(de::Error::custom),
        other => Err(de::Error::custom(format!(
            "expected a non-negative number, got {:?}",
            other.into_text()
        ))),
    }
}

fn deserialize_success_check_timeout<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_number(deserializer)?.unwrap_or_else(default_success_check_timeout))
}

fn deserialize_success_check_delay<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(deserialize_number(deserializer)?.unwrap_or_else(default_success_check_delay))
}

/// Package list as it may arrive from a config file or a CI input.
#[derive(Deserialize)]
#[serde(untagged)]
enum PackageList {
    /// Comma or whitespace separated names, e.g. `"orders, invoices"`.
    Joined(String),

    /// Regular TOML array.
    List(Vec<Scalar>),
}

/// Accept both a list and a separated string of package names.
fn deserialize_package_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let names: Vec<String> = match PackageList::deserialize(deserializer)? {
        PackageList::Joined(joined) => joined
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(str::to_owned)
            .collect(),
        PackageList::List(list) => list.into_iter().map(Scalar::into_text).collect(),
    };

    Ok(names
        .into_iter()
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty())
        .collect())
}

/// Accept native booleans along with `"true"`, `"false"` and `""`.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Bool(value) => Ok(value),
        Scalar::Text(text) => match text.trim().to_ascii_lowercase().as_str() {
            "" | "false" => Ok(false),
            "true" => Ok(true),
            other => Err(de::Error::custom(format!(
                "expected a boolean value, got {other:?}"
            ))),
        },
        other => Err(de::Error::custom(format!(
            "expected a boolean value, got {:?}",
            other.into_text()
        ))),
    }
}

/// Merge environment variables as plain strings.
///
/// [`Env`] parses values, so `[ac]` becomes a list and `2024` becomes a number.
/// Every value is kept exactly as it was set instead, leaving interpretation
/// to the field deserializers.
fn merge_verbatim(figment: Figment, env: Env) -> Figment {
    env.iter().fold(figment, |figment, (key, value)| {
        figment.merge(Serialized::default(key.as_str(), value))
    })
}

/// Logging configuration.
#[cfg(feature = "logging")]
#[derive(Deserialize)]
pub struct Logging {
    /// Log level.
    #[serde(deserialize_with = "deserialize_from_str")]
    pub level: LevelFilter,
}

#[cfg(feature = "logging")]
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
        }
    }
}

/// General configuration.
#[derive(Deserialize)]
pub struct Config {
    /// Base URL of the integration server, e.g. `https://esb.example.com`.
    #[serde(deserialize_with = "deserialize_text")]
    pub base_url: String,

    /// Bearer token used to authorize API requests.
    #[serde(deserialize_with = "deserialize_text")]
    pub access_token: String,

    /// Directory, immediate subdirectories of which are deployable packages.
    #[serde(default = "default_package_dir")]
    pub package_dir: PathBuf,

    /// Regular expression that package names must fully match.
    #[serde(default, deserialize_with = "deserialize_optional_text")]
    pub package_name_pattern: Option<String>,

    /// Explicit list of package names, which takes precedence over the pattern.
    #[serde(default, deserialize_with = "deserialize_package_list")]
    pub allowed_packages: Vec<String>,

    /// Confirm deployment by polling package status after the upload.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub async_upload: bool,

    /// Maximum count of status checks per package.
    #[serde(
        default = "default_success_check_timeout",
        alias = "max_attempts",
        deserialize_with = "deserialize_success_check_timeout"
    )]
    pub success_check_timeout: u32,

    /// Delay between status checks, in seconds.
    #[serde(
        default = "default_success_check_delay",
        deserialize_with = "deserialize_success_check_delay"
    )]
    pub success_check_delay: u64,

    /// Check just this package instead of every uploaded one.
    #[serde(default, deserialize_with = "deserialize_optional_text")]
    pub success_check_package_name: Option<String>,

    /// Treat an empty package selection as a failure.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub fail_when_empty: bool,

    /// Treat a package that never reported `STARTED` as a failure.
    #[serde(default, deserialize_with = "deserialize_flag")]
    pub require_started: bool,

    /// File that status check evidence is appended to.
    #[serde(default)]
    pub evidence_log: Option<PathBuf>,

    /// File that named outputs are appended to (`GITHUB_OUTPUT` on GitHub Actions).
    #[serde(default)]
    pub output_file: Option<PathBuf>,

    /// Logging configuration.
    #[cfg(feature = "logging")]
    #[serde(default)]
    pub logging: Logging,
}

// Defaults match the inputs declared by the CI action.
fn default_package_dir() -> PathBuf {
    PathBuf::from("packages")
}

fn default_success_check_timeout() -> u32 {
    6
}

fn default_success_check_delay() -> u64 {
    30
}

impl Config {
    /// Create new config using the configuration file and environment variables.
    ///
    /// Sources are merged in the following order, later ones taking precedence:
    /// the TOML file (`Deploy.toml` by default, may be absent), `INPUT_*` variables
    /// set by GitHub Actions for action inputs and `DEPLOY_*` variables. Nested keys
    /// of `DEPLOY_*` variables are separated with a double underscore, for example
    /// `DEPLOY_LOGGING__LEVEL`. The `GITHUB_OUTPUT` variable sets [`Config::output_file`].
    ///
    /// Variable values are passed through unparsed, and empty numeric inputs fall back
    /// to their defaults.
    ///
    /// See [`Env`] for more details on how to use environment variables configuration.
    ///
    /// [`Env`]: figment::providers::Env
    pub fn new(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let figment =
            Figment::new().merge(Toml::file(path.unwrap_or(PathBuf::from("Deploy.toml"))));
        let figment = merge_verbatim(
            figment,
            Env::raw().only(&["GITHUB_OUTPUT"]).map(|_| "output_file".into()),
        );
        let figment = merge_verbatim(figment, Env::prefixed("INPUT_"));
        let figment = merge_verbatim(figment, Env::prefixed("DEPLOY_").split("__"));

        let config: Self = figment.extract()?;

        config.validate()
    }

    /// Ensure required inputs are not blank.
    fn validate(self) -> Result<Self, ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingInput("base_url"));
        }

        if self.access_token.trim().is_empty() {
            return Err(ConfigError::MissingInput("access_token"));
        }

        Ok(self)
    }

    /// Package name pattern, with blank values treated as "match everything".
    pub fn package_name_pattern(&self) -> &str {
        self.package_name_pattern
            .as_deref()
            .map(str::trim)
            .filter(|pattern| !pattern.is_empty())
            .unwrap_or(MATCH_ALL_PATTERN)
    }

    /// Single package to check, if one was requested.
    pub fn success_check_package_name(&self) -> Option<&str> {
        self.success_check_package_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }

    /// Delay between two consecutive status checks.
    pub fn success_check_delay(&self) -> Duration {
        Duration::from_secs(self.success_check_delay)
    }

    /// Create new config suitable for running unit tests.
    #[cfg(feature = "test-utils")]
    pub fn for_tests() -> Self {
        Self {
            base_url: String::from("http://127.0.0.1:8080"),
            access_token: String::from("testtoken"),
            package_dir: default_package_dir(),
            package_name_pattern: None,
            allowed_packages: Vec::new(),
            async_upload: false,
            success_check_timeout: default_success_check_timeout(),
            success_check_delay: default_success_check_delay(),
            success_check_package_name: None,
            fail_when_empty: false,
            require_started: false,
            evidence_log: None,
            output_file: None,
            #[cfg(feature = "logging")]
            logging: Logging::default(),
        }
    }
}
