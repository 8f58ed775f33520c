//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.
//! This binary is a thin, headless driver around `takion-core`: it owns the
//! out-of-scope bootstrap (reading a previously-acquired session token off
//! disk) and hands an immutable [`takion_core::Session`] to the engine.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use takion_core::{HostType, LaunchOptions, Session, VideoCodec};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Console generation: `"ps4"` or `"ps5"`.
    pub host_type: String,

    /// Console address, e.g. `"192.168.1.50:9296"`.
    /// Override: `TAKION_HOST_ENDPOINT`
    pub host_endpoint: Option<SocketAddr>,

    /// ASCII session identifier assigned by the console during the
    /// out-of-scope HTTP registration step.
    /// Override: `TAKION_SESSION_ID`
    pub session_id: Option<String>,

    /// 32-byte pre-shared secret, hex-encoded.
    /// Override: `TAKION_SECRET_HEX`
    pub secret_hex: Option<String>,

    /// 16-byte session IV, hex-encoded.
    /// Override: `TAKION_SESSION_IV_HEX`
    pub session_iv_hex: Option<String>,

    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// `"h264"`, `"h265"`, or `"av1"`.
    pub codec: String,
    pub hdr: bool,

    /// IP address the console's control connection originates from, used
    /// only to bind the local UDP socket to the right interface.
    /// Override: `TAKION_BIND_IP`
    pub bind_ip: Option<IpAddr>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host_type: "ps5".to_string(),
            host_endpoint: None,
            session_id: None,
            secret_hex: None,
            session_iv_hex: None,
            width: 1920,
            height: 1080,
            fps: 60,
            bitrate_kbps: 15000,
            codec: "h264".to_string(),
            hdr: false,
            bind_ip: None,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TAKION_HOST_ENDPOINT") {
            if let Ok(addr) = val.parse() {
                self.host_endpoint = Some(addr);
            }
        }
        if let Ok(val) = std::env::var("TAKION_SESSION_ID") {
            self.session_id = Some(val);
        }
        if let Ok(val) = std::env::var("TAKION_SECRET_HEX") {
            self.secret_hex = Some(val);
        }
        if let Ok(val) = std::env::var("TAKION_SESSION_IV_HEX") {
            self.session_iv_hex = Some(val);
        }
        if let Ok(val) = std::env::var("TAKION_BIND_IP") {
            if let Ok(ip) = val.parse() {
                self.bind_ip = Some(ip);
            }
        }
    }

    /// Converts to a `takion-core` [`Session`], the opaque, immutable value
    /// the registration layer is responsible for producing.
    ///
    /// # Errors
    /// Returns an error if a required field is missing or malformed (host
    /// type, endpoint, session id, secret/IV hex length, codec name).
    pub fn to_session(&self) -> Result<Session> {
        let host_type = match self.host_type.to_ascii_lowercase().as_str() {
            "ps4" => HostType::Ps4,
            "ps5" => HostType::Ps5,
            other => bail!("unknown host_type '{other}', expected 'ps4' or 'ps5'"),
        };
        let host_endpoint = self
            .host_endpoint
            .context("host_endpoint is required (set it in the config file or TAKION_HOST_ENDPOINT)")?;
        let session_id = self
            .session_id
            .clone()
            .context("session_id is required (set it in the config file or TAKION_SESSION_ID)")?;
        let secret = decode_fixed::<32>(
            self.secret_hex
                .as_deref()
                .context("secret_hex is required (set it in the config file or TAKION_SECRET_HEX)")?,
            "secret_hex",
        )?;
        let session_iv = decode_fixed::<16>(
            self.session_iv_hex.as_deref().context(
                "session_iv_hex is required (set it in the config file or TAKION_SESSION_IV_HEX)",
            )?,
            "session_iv_hex",
        )?;
        let codec = match self.codec.to_ascii_lowercase().as_str() {
            "h264" => VideoCodec::H264,
            "h265" => VideoCodec::H265,
            "av1" => VideoCodec::Av1,
            other => bail!("unknown codec '{other}', expected 'h264', 'h265', or 'av1'"),
        };

        Ok(Session {
            host_type,
            host_endpoint,
            session_id,
            secret,
            session_iv,
            launch_options: LaunchOptions {
                width: self.width,
                height: self.height,
                fps: self.fps,
                bitrate_kbps: self.bitrate_kbps,
                codec,
                hdr: self.hdr,
            },
            rtt_us: None,
            mtu_out: None,
        })
    }
}

fn decode_fixed<const N: usize>(hex: &str, field: &str) -> Result<[u8; N]> {
    let bytes = hex_decode(hex).with_context(|| format!("{field} is not valid hex"))?;
    if bytes.len() != N {
        bail!("{field} must decode to {N} bytes, got {}", bytes.len());
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes);
    Ok(out)
}

fn hex_decode(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        bail!("hex string has odd length");
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).context("invalid hex digit"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_fixed_rejects_wrong_length() {
        let err = decode_fixed::<32>("aabb", "secret_hex").unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn decode_fixed_accepts_correct_length() {
        let hex = "00".repeat(16);
        let iv = decode_fixed::<16>(&hex, "session_iv_hex").unwrap();
        assert_eq!(iv, [0u8; 16]);
    }

    #[test]
    fn to_session_requires_host_endpoint() {
        let config = ServerConfig::default();
        let err = config.to_session().unwrap_err();
        assert!(err.to_string().contains("host_endpoint"));
    }
}
