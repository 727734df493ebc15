use std::env;
use std::time::Duration;

use thiserror::Error;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CHAT_LABEL: &str = "chat";

/// One STUN/TURN entry handed to the peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    /// True when at least one url can discover a public address.
    pub fn crosses_nat(&self) -> bool {
        self.urls.iter().any(|url| {
            let scheme = url.split(':').next().unwrap_or_default();
            matches!(scheme, "stun" | "stuns" | "turn" | "turns")
        })
    }

    fn needs_credentials(&self) -> bool {
        self.urls
            .iter()
            .any(|url| url.starts_with("turn:") || url.starts_with("turns:"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub frame_rate: u32,
}

impl Default for VideoConstraints {
    fn default() -> Self {
        Self {
            ideal_width: 1280,
            ideal_height: 720,
            frame_rate: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for AudioConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Capture request passed to the media primitive. A `None` kind is not
/// requested at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub video: Option<VideoConstraints>,
    pub audio: Option<AudioConstraints>,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            video: Some(VideoConstraints::default()),
            audio: Some(AudioConstraints::default()),
        }
    }
}

impl MediaConstraints {
    pub fn select(&self, video: bool, audio: bool) -> Self {
        Self {
            video: if video { self.video.or(Some(VideoConstraints::default())) } else { None },
            audio: if audio { self.audio.or(Some(AudioConstraints::default())) } else { None },
        }
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }
}

/// Everything a session controller needs that is not an injected collaborator.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
    /// Upper bound on the signaling handshake.
    pub connect_timeout: Duration,
    pub data_channel_label: String,
    pub media: MediaConstraints,
    /// Which kinds to capture when a session starts.
    pub send_video: bool,
    pub send_audio: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            data_channel_label: DEFAULT_CHAT_LABEL.to_string(),
            media: MediaConstraints::default(),
            send_video: true,
            send_audio: true,
        }
    }
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// No STUN/TURN at all; only host candidates, good for loopback tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Default::default()
        }
    }

    /// Builds a configuration from `FIELDCALL_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut builder = SessionConfigBuilder::new();

        if env_truthy("FIELDCALL_LOCALHOST_ONLY") {
            builder = builder.localhost_only();
        } else if let Ok(list) = env::var("FIELDCALL_ICE_SERVERS") {
            let username = env::var("FIELDCALL_TURN_USERNAME").ok();
            let credential = env::var("FIELDCALL_TURN_CREDENTIAL").ok();
            for url in list.split(',').map(str::trim).filter(|url| !url.is_empty()) {
                let server = IceServer {
                    urls: vec![url.to_string()],
                    username: username.clone().filter(|_| url.starts_with("turn")),
                    credential: credential.clone().filter(|_| url.starts_with("turn")),
                };
                builder = builder.add_ice_server(server);
            }
        }

        if let Ok(raw) = env::var("FIELDCALL_CONNECT_TIMEOUT_SECS") {
            let secs: u64 = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                key: "FIELDCALL_CONNECT_TIMEOUT_SECS",
                value: raw.clone(),
            })?;
            builder = builder.connect_timeout(Duration::from_secs(secs));
        }

        builder.build()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("at least one stun or turn server is required for cross-NAT sessions")]
    MissingStun,
    #[error("ice server url {0:?} has no known scheme")]
    InvalidIceUrl(String),
    #[error("turn server {0:?} needs a username and credential")]
    MissingCredential(String),
    #[error("connect timeout must be greater than zero")]
    ZeroTimeout,
    #[error("data channel label must not be empty")]
    EmptyLabel,
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    ice_servers: Vec<IceServer>,
    localhost_only: bool,
    connect_timeout: Option<Duration>,
    data_channel_label: Option<String>,
    media: Option<MediaConstraints>,
    send_video: Option<bool>,
    send_audio: Option<bool>,
}

impl SessionConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, server: IceServer) -> Self {
        self.ice_servers.push(server);
        self
    }

    pub fn add_stun(self, url: impl Into<String>) -> Self {
        self.add_ice_server(IceServer::stun(url))
    }

    pub fn add_turn(
        self,
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        self.add_ice_server(IceServer::turn(url, username, credential))
    }

    pub fn localhost_only(mut self) -> Self {
        self.localhost_only = true;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn data_channel_label(mut self, label: impl Into<String>) -> Self {
        self.data_channel_label = Some(label.into());
        self
    }

    pub fn media(mut self, media: MediaConstraints) -> Self {
        self.media = Some(media);
        self
    }

    pub fn send_video(mut self, enabled: bool) -> Self {
        self.send_video = Some(enabled);
        self
    }

    pub fn send_audio(mut self, enabled: bool) -> Self {
        self.send_audio = Some(enabled);
        self
    }

    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        let mut config = if self.localhost_only {
            SessionConfig::localhost()
        } else {
            SessionConfig::default()
        };

        if !self.ice_servers.is_empty() {
            for server in &self.ice_servers {
                if let Some(url) = server.urls.iter().find(|url| !url.contains(':')) {
                    return Err(ConfigError::InvalidIceUrl(url.clone()));
                }
                if server.needs_credentials()
                    && (server.username.is_none() || server.credential.is_none())
                {
                    return Err(ConfigError::MissingCredential(server.urls.join(",")));
                }
            }
            config.ice_servers = self.ice_servers;
        }

        if !self.localhost_only && !config.ice_servers.iter().any(IceServer::crosses_nat) {
            return Err(ConfigError::MissingStun);
        }

        if let Some(timeout) = self.connect_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::ZeroTimeout);
            }
            config.connect_timeout = timeout;
        }

        if let Some(label) = self.data_channel_label {
            if label.trim().is_empty() {
                return Err(ConfigError::EmptyLabel);
            }
            config.data_channel_label = label;
        }

        if let Some(media) = self.media {
            config.media = media;
        }
        if let Some(video) = self.send_video {
            config.send_video = video;
        }
        if let Some(audio) = self.send_audio {
            config.send_audio = audio;
        }

        Ok(config)
    }
}

pub(crate) fn env_truthy(key: &str) -> bool {
    match env::var(key) {
        Ok(val) => matches!(
            val.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{LazyLock, Mutex};

    // env mutation is process-wide
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const ENV_KEYS: [&str; 5] = [
        "FIELDCALL_LOCALHOST_ONLY",
        "FIELDCALL_ICE_SERVERS",
        "FIELDCALL_TURN_USERNAME",
        "FIELDCALL_TURN_CREDENTIAL",
        "FIELDCALL_CONNECT_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            unsafe { env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_match_browser_client() {
        let config = SessionConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.data_channel_label, "chat");
        assert_eq!(config.ice_servers, vec![IceServer::stun(DEFAULT_STUN_URL)]);
        let video = config.media.video.expect("video constraints");
        assert_eq!((video.ideal_width, video.ideal_height), (1280, 720));
        assert!(config.media.audio.expect("audio constraints").echo_cancellation);
    }

    #[test]
    fn builder_rejects_host_only_servers_without_localhost_flag() {
        let err = SessionConfig::builder()
            .add_ice_server(IceServer {
                urls: vec!["host:192.168.1.1".into()],
                username: None,
                credential: None,
            })
            .build()
            .expect_err("no stun");
        assert_eq!(err, ConfigError::MissingStun);

        let config = SessionConfig::builder().localhost_only().build().expect("localhost");
        assert!(config.ice_servers.is_empty());
    }

    #[test]
    fn turn_requires_credentials() {
        let err = SessionConfig::builder()
            .add_ice_server(IceServer::stun("turn:turn.example.org:3478"))
            .build()
            .expect_err("credentials");
        assert!(matches!(err, ConfigError::MissingCredential(_)));

        let config = SessionConfig::builder()
            .add_stun("stun:stun.example.org:3478")
            .add_turn("turn:turn.example.org:3478", "farmer", "secret")
            .connect_timeout(Duration::from_secs(3))
            .data_channel_label("consult-chat")
            .build()
            .expect("valid");
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.data_channel_label, "consult-chat");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let err = SessionConfig::builder()
            .connect_timeout(Duration::ZERO)
            .build()
            .expect_err("zero");
        assert_eq!(err, ConfigError::ZeroTimeout);
    }

    #[test]
    fn media_selection_drops_unrequested_kinds() {
        let selected = MediaConstraints::default().select(false, true);
        assert!(selected.video.is_none());
        assert!(selected.audio.is_some());
        assert!(MediaConstraints::default().select(false, false).is_empty());
    }

    #[test]
    fn from_env_reads_servers_and_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe {
            env::set_var(
                "FIELDCALL_ICE_SERVERS",
                "stun:stun.example.org:3478, turn:turn.example.org:3478",
            );
            env::set_var("FIELDCALL_TURN_USERNAME", "kisan");
            env::set_var("FIELDCALL_TURN_CREDENTIAL", "pw");
            env::set_var("FIELDCALL_CONNECT_TIMEOUT_SECS", "4");
        }
        let config = SessionConfig::from_env().expect("config");
        clear_env();

        assert_eq!(config.connect_timeout, Duration::from_secs(4));
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].username, None);
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("kisan"));
    }

    #[test]
    fn from_env_rejects_bad_timeout() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("FIELDCALL_CONNECT_TIMEOUT_SECS", "soon") };
        let err = SessionConfig::from_env().expect_err("bad timeout");
        clear_env();
        assert!(matches!(err, ConfigError::InvalidEnv { .. }));
    }

    #[test]
    fn from_env_localhost_only() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_env();
        unsafe { env::set_var("FIELDCALL_LOCALHOST_ONLY", "yes") };
        let config = SessionConfig::from_env().expect("config");
        clear_env();
        assert!(config.ice_servers.is_empty());
    }
}
