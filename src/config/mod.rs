use std::{collections::HashMap, fs, time::Duration};

use http::{HeaderMap, HeaderName, HeaderValue, Uri};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::{ErrorContext, RequestError, RequestResult};

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    #[validate(nested)]
    pub client: ClientConfig,

    #[validate(nested)]
    pub log: Option<Log>,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> RequestResult<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .with_context(&format!("Unable to read conf file from {path}"))?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    pub fn from_yaml(conf_str: &str) -> RequestResult<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config =
            serde_yaml::from_str(conf_str).with_context("Unable to parse yaml conf")?;

        trace!("Loaded conf: {conf:?}");

        conf.validate().with_context("Conf file validation failed")?;

        Ok(conf)
    }

    pub fn to_yaml(&self) -> RequestResult<String> {
        serde_yaml::to_string(self).with_context("Unable to serialize conf")
    }
}

/// What to do with a caller-declared `content-length` when the body has a
/// derivable length of its own
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentLengthPolicy {
    /// Body-derived length always wins
    #[default]
    Overwrite,
    /// Keep the caller's value; derive only when none was declared
    Preserve,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "ClientConfig::validate_headers"))]
pub struct ClientConfig {
    #[validate(custom(function = "ClientConfig::validate_base_url"))]
    pub base_url: Option<String>,

    #[serde(default)]
    pub headers: HashMap<String, String>,

    #[validate(nested)]
    pub timeout: Option<Timeout>,

    #[serde(default)]
    pub content_length: ContentLengthPolicy,

    #[serde(default = "ClientConfig::default_write_buffer")]
    #[validate(range(min = 1))]
    pub write_buffer: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            timeout: None,
            content_length: ContentLengthPolicy::default(),
            write_buffer: Self::default_write_buffer(),
        }
    }
}

impl ClientConfig {
    fn default_write_buffer() -> usize {
        crate::transport::DEFAULT_WRITE_BUFFER
    }

    fn validate_base_url(base_url: &str) -> Result<(), ValidationError> {
        let uri = base_url
            .parse::<Uri>()
            .map_err(|_| ValidationError::new("base_url_invalid"))?;
        if uri.scheme().is_none() || uri.authority().is_none() {
            return Err(ValidationError::new("base_url_must_be_absolute"));
        }
        Ok(())
    }

    fn validate_headers(&self) -> Result<(), ValidationError> {
        self.header_map()
            .map(|_| ())
            .map_err(|_| ValidationError::new("invalid_default_header"))
    }

    pub fn base_uri(&self) -> RequestResult<Option<Uri>> {
        self.base_url
            .as_deref()
            .map(|url| {
                url.parse::<Uri>()
                    .map_err(|e| RequestError::Configuration(format!("base_url {url}: {e}")))
            })
            .transpose()
    }

    /// Default headers as a typed map.
    pub fn header_map(&self) -> RequestResult<HeaderMap> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .with_context(&format!("Invalid header name {name}"))?;
            let value = HeaderValue::from_str(value)
                .with_context(&format!("Invalid value for header {name}"))?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

/// Timeouts in seconds
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Timeout {
    #[validate(range(min = 1))]
    pub connect: Option<u64>,
    #[validate(range(min = 1))]
    pub read: Option<u64>,
}

impl Timeout {
    pub fn connect_duration(&self) -> Option<Duration> {
        self.connect.map(Duration::from_secs)
    }

    pub fn read_duration(&self) -> Option<Duration> {
        self.read.map(Duration::from_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1))]
    pub path: String,
    pub level: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn test_load_file() {
        init_log();
        let conf_str = r#"
---
client:
  base_url: http://127.0.0.1:8080/api
  headers:
    user-agent: pingcall
    accept: "*/*"
  timeout:
    connect: 5
    read: 30
  content_length: preserve
  write_buffer: 4

log:
  path: /var/log/pingcall.log
  level: debug
        "#;
        let conf = Config::from_yaml(conf_str).unwrap();
        let client = &conf.client;
        assert_eq!(client.base_url.as_deref(), Some("http://127.0.0.1:8080/api"));
        assert_eq!(client.header_map().unwrap().len(), 2);
        assert_eq!(
            client.timeout.as_ref().unwrap().connect_duration(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(client.content_length, ContentLengthPolicy::Preserve);
        assert_eq!(client.write_buffer, 4);
        assert_eq!(conf.log.unwrap().level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_defaults() {
        init_log();
        let conf = Config::from_yaml("client: {}").unwrap();
        assert_eq!(conf.client.content_length, ContentLengthPolicy::Overwrite);
        assert_eq!(conf.client.write_buffer, crate::transport::DEFAULT_WRITE_BUFFER);
        assert!(conf.client.base_uri().unwrap().is_none());
        assert!(conf.log.is_none());

        let yaml = conf.to_yaml().unwrap();
        assert!(yaml.contains("content_length: overwrite"));
    }

    #[test]
    fn test_invalid_confs() {
        init_log();
        let cases = [
            "client:\n  base_url: /relative\n",
            "client:\n  write_buffer: 0\n",
            "client:\n  timeout:\n    read: 0\n",
            "client:\n  headers:\n    \"bad header\": x\n",
            "client:\n  content_length: sometimes\n",
            "log:\n  path: \"\"\n",
        ];
        for conf_str in cases {
            let err = Config::from_yaml(conf_str).unwrap_err();
            assert!(
                matches!(err, RequestError::Configuration(_)),
                "{conf_str} should be rejected"
            );
        }
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load_from_yaml("/nonexistent/pingcall.yaml").unwrap_err();
        assert!(err.to_string().contains("Unable to read conf file"));
    }
}
