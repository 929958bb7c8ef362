use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserSettings {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    /// Address the proxy listener binds to.
    pub listen: SocketAddr,

    #[serde(default)]
    pub tcp_nodelay: bool,

    /// Basic credentials accepted by the listener. Leaving this out disables
    /// proxy authentication entirely.
    pub users: Option<Vec<UserSettings>>,
}

pub fn init() -> Settings {
    toml::from_str(&std::fs::read_to_string("./config.toml").expect("Failed to read config file"))
        .expect("Failed to parse config file")
}
