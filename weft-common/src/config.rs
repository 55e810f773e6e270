// Copyright 2024-2025 Weft Compute
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::retries::RetryConfig;
use crate::SafeDisplay;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const ENV_PREFIX: &str = "WEFT__";
const ENV_SEPARATOR: &str = "__";

/// Layered configuration loader: compiled-in defaults, overridden by an
/// optional TOML file, overridden by `WEFT__`-prefixed environment
/// variables (`__` separates nesting levels).
pub struct ConfigLoader<T: Default + Serialize + DeserializeOwned> {
    pub config_file_path: PathBuf,
    phantom: PhantomData<T>,
}

impl<T: Default + Serialize + DeserializeOwned> ConfigLoader<T> {
    pub fn new(config_file_path: &Path) -> Self {
        Self {
            config_file_path: config_file_path.to_path_buf(),
            phantom: PhantomData,
        }
    }

    pub fn figment(&self) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(T::default()))
            .merge(Toml::file(&self.config_file_path))
            .merge(Env::prefixed(ENV_PREFIX).split(ENV_SEPARATOR))
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        self.figment().extract()
    }

    /// Returns the loaded config, or `None` when the process should exit
    /// instead of starting: either `--dump-config` was requested or the
    /// config could not be loaded.
    pub fn load_or_dump_config(&self) -> Option<T> {
        if std::env::args().any(|arg| arg == "--dump-config") {
            match self.load() {
                Ok(config) => match toml::to_string_pretty(&config) {
                    Ok(rendered) => println!("{rendered}"),
                    Err(err) => eprintln!("Failed to render config: {err}"),
                },
                Err(err) => eprintln!("Failed to load config: {err}"),
            }
            None
        } else {
            match self.load() {
                Ok(config) => Some(config),
                Err(err) => {
                    eprintln!("Failed to load config: {err}");
                    None
                }
            }
        }
    }
}

/// Location and client settings of a remote weft service. Only the URL
/// is required; the rest defaults so a single env var can point a
/// component at its remote.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteServiceConfig {
    pub url: Url,
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub retries: RetryConfig,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

impl RemoteServiceConfig {
    pub fn localhost(port: u16) -> Self {
        Self {
            url: Url::parse(&format!("http://localhost:{port}"))
                .expect("hardcoded localhost URL must parse"),
            request_timeout: Duration::from_secs(5),
            retries: RetryConfig::default(),
        }
    }
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        Self::localhost(9870)
    }
}

impl SafeDisplay for RemoteServiceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "URL: {}", self.url);
        let _ = writeln!(
            &mut result,
            "request timeout: {}s",
            self.request_timeout.as_secs()
        );
        let _ = writeln!(&mut result, "retries:");
        let _ = writeln!(&mut result, "{}", self.retries.to_safe_string_indented());
        result
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        name: String,
        port: u16,
    }

    #[test]
    fn defaults_load_without_a_config_file() {
        let loader: ConfigLoader<TestConfig> =
            ConfigLoader::new(Path::new("does/not/exist.toml"));
        let config = loader.load().expect("defaults must load");
        assert_eq!(config, TestConfig::default());
    }
}
