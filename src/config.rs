use crate::transport::MediaConstraints;
use anyhow::{anyhow, Error, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    pub voip: VoipConfig,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct VoipConfig {
    #[serde(alias = "authUserName")]
    pub auth_user_name: String,
    #[serde(alias = "authPassword")]
    pub auth_password: String,
    #[serde(alias = "sipRegistrarHostnameOrIP")]
    pub sip_registrar_hostname_or_ip: String,
    #[serde(alias = "webSocketURI")]
    pub web_socket_uri: String,
    #[serde(default, alias = "iceServers")]
    pub ice_servers: Vec<IceServerItem>,
    #[serde(default, alias = "enableVideo")]
    pub enable_video: bool,
    /// Name of the element remote media is rendered into
    #[serde(default, alias = "mediaTarget")]
    pub media_target: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default, Serialize)]
pub struct IceServerItem {
    pub urls: Vec<String>,
    pub username: Option<String>,
    #[serde(alias = "credential")]
    pub password: Option<String>,
}

impl Default for VoipConfig {
    fn default() -> Self {
        Self {
            auth_user_name: String::new(),
            auth_password: String::new(),
            sip_registrar_hostname_or_ip: "127.0.0.1".to_string(),
            web_socket_uri: "ws://127.0.0.1:8088/ws".to_string(),
            ice_servers: vec![],
            enable_video: false,
            media_target: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            voip: VoipConfig::default(),
        }
    }
}

impl VoipConfig {
    pub fn aor(&self) -> String {
        format!(
            "sip:{}@{}",
            self.auth_user_name, self.sip_registrar_hostname_or_ip
        )
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: true,
            video: self.enable_video,
        }
    }

    pub fn media_target(&self) -> &str {
        self.media_target.as_deref().unwrap_or("remote-media")
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth_user_name.trim().is_empty() {
            return Err(anyhow!("auth_user_name is required"));
        }
        if self.sip_registrar_hostname_or_ip.trim().is_empty() {
            return Err(anyhow!("sip_registrar_hostname_or_ip is required"));
        }
        let uri = url::Url::parse(&self.web_socket_uri)
            .map_err(|e| anyhow!("invalid web_socket_uri {}: {}", self.web_socket_uri, e))?;
        if !matches!(uri.scheme(), "ws" | "wss") {
            return Err(anyhow!(
                "web_socket_uri must use ws or wss, got {}",
                uri.scheme()
            ));
        }
        for server in self.ice_servers.iter() {
            if server.urls.is_empty() {
                return Err(anyhow!("ice server without urls"));
            }
            for url in server.urls.iter() {
                if !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:"))
                {
                    return Err(anyhow!("unsupported ice server url: {}", url));
                }
            }
        }
        Ok(())
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
