// Copyright 2025 Chris Custine
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

//! Application configuration management.
//!
//! Configuration is stored as TOML in the platform config directory. Missing
//! fields fall back to their defaults so older files keep loading.

use fusion_client::endpoint::{self, PUBLISH_SUFFIX, UPDATES_SUFFIX};
use fusion_client::{EndpointError, RetryConfig, Route, DEFAULT_GPSD_ADDRESS};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "shuttle-tracker";
const CONFIG_NAME: &str = "config";

/// Default page origin the socket URLs are derived from
pub const DEFAULT_SERVER_URL: &str = "http://localhost:8080/";

/// Application configuration stored in TOML format
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// Configuration schema version for migrations
    #[serde(default = "default_config_version")]
    pub config_version: u32,

    /// Page URL of the tracking server; socket URLs are derived from it
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Explicit publishing socket URL, overriding the derived one
    #[serde(default)]
    pub socket_url: Option<String>,

    /// Path suffix of the publishing endpoint
    #[serde(default = "default_socket_suffix")]
    pub socket_suffix: String,

    /// Explicit inbound vehicle feed URL, overriding the derived one
    #[serde(default)]
    pub feed_url: Option<String>,

    /// gpsd address in host:port format
    #[serde(default = "default_gpsd_address")]
    pub gpsd_address: String,

    /// Reconnect behaviour for every socket
    #[serde(default)]
    pub retry: RetryConfig,

    /// Routes vehicles in the inbound feed can be assigned to
    #[serde(default)]
    pub routes: Vec<Route>,
}

// Default value functions for serde
fn default_config_version() -> u32 {
    1
}

fn default_server_url() -> String {
    DEFAULT_SERVER_URL.to_string()
}

fn default_socket_suffix() -> String {
    PUBLISH_SUFFIX.to_string()
}

fn default_gpsd_address() -> String {
    DEFAULT_GPSD_ADDRESS.to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            config_version: default_config_version(),
            server_url: default_server_url(),
            socket_url: None,
            socket_suffix: default_socket_suffix(),
            feed_url: None,
            gpsd_address: default_gpsd_address(),
            retry: RetryConfig::default(),
            routes: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, writing defaults on first run
    pub fn load() -> Result<Self, confy::ConfyError> {
        confy::load(APP_NAME, CONFIG_NAME)
    }

    /// Get the config file path for display to user
    pub fn get_config_path() -> Result<std::path::PathBuf, confy::ConfyError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME)
    }

    /// Socket URL location fixes are published to
    pub fn publish_url(&self) -> Result<String, EndpointError> {
        endpoint::resolve(self.socket_url.as_deref(), &self.server_url, &self.socket_suffix)
    }

    /// Socket URL inbound vehicle updates arrive on
    pub fn updates_url(&self) -> Result<String, EndpointError> {
        endpoint::resolve(self.feed_url.as_deref(), &self.server_url, UPDATES_SUFFIX)
    }
}
