//! Connection and client configuration: JSON parsing, cross-field
//! validation, and derivation of payload size and buffer partition layout.
//!
//! Validation failures are classified the way the originating implementation
//! classifies them: [`ConfigError::Invalid`] for a malformed or unknown
//! value, [`ConfigError::Incompatible`] for a well-formed but semantically
//! inconsistent combination (e.g. a blob payload paired with an ST 2110
//! connection).

use mcm_buffer::BufferPartitions;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid connection configuration: {0}")]
    Invalid(String),
    #[error("incompatible connection configuration: {0}")]
    Incompatible(String),
}

/// Which direction a connection moves payload: set by the SDK call used to
/// create it (`create_tx_connection` vs `create_rx_connection`), not parsed
/// from JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    St2110_20,
    St2110_22,
    St2110_30,
}

impl TransportKind {
    fn from_u8(v: u8) -> Result<Self, ConfigError> {
        match v {
            20 => Ok(TransportKind::St2110_20),
            22 => Ok(TransportKind::St2110_22),
            30 => Ok(TransportKind::St2110_30),
            other => Err(ConfigError::Invalid(format!(
                "unsupported st2110 transport {other}, expected one of 20, 22, 30"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    MultipointGroup {
        urn: String,
    },
    St2110 {
        ip_addr: String,
        port: u16,
        mcast_sip_addr: String,
        transport: TransportKind,
        pacing: String,
        payload_type: u8,
        transport_pixel_format: Option<String>,
    },
    Rdma {
        connection_mode: String,
        max_latency_ns: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuv422p10le,
    V210,
    Yuv422Rfc4175be10,
}

impl PixelFormat {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "yuv422p10le" => Ok(PixelFormat::Yuv422p10le),
            "v210" => Ok(PixelFormat::V210),
            "yuv422rfc4175be10" => Ok(PixelFormat::Yuv422Rfc4175be10),
            other => Err(ConfigError::Invalid(format!("unknown pixel format '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    PcmS8,
    PcmS16Be,
    PcmS24Be,
}

impl AudioFormat {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "pcm_s8" => Ok(AudioFormat::PcmS8),
            "pcm_s16be" => Ok(AudioFormat::PcmS16Be),
            "pcm_s24be" => Ok(AudioFormat::PcmS24Be),
            other => Err(ConfigError::Invalid(format!("unknown audio format '{other}'"))),
        }
    }

    fn sample_size(self) -> u32 {
        match self {
            AudioFormat::PcmS8 => 1,
            AudioFormat::PcmS16Be => 2,
            AudioFormat::PcmS24Be => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadType {
    Video {
        width: u32,
        height: u32,
        fps: u32,
        pixel_format: PixelFormat,
    },
    Audio {
        channels: u32,
        sample_rate: u32,
        format: AudioFormat,
        packet_time: String,
    },
    Blob,
}

/// Looks up the samples-per-packet for a validated `(sample_rate,
/// packet_time)` pair. Returns `None` for incompatible combinations.
fn samples_per_packet(sample_rate: u32, packet_time: &str) -> Option<u32> {
    match (sample_rate, packet_time) {
        (48_000, "1ms") => Some(48),
        (48_000, "125us") => Some(6),
        (48_000, "250us") => Some(12),
        (48_000, "333us") => Some(16),
        (48_000, "4ms") => Some(192),
        (48_000, "80us") => Some(4),
        (96_000, "1ms") => Some(96),
        (96_000, "125us") => Some(12),
        (96_000, "250us") => Some(24),
        (96_000, "333us") => Some(32),
        (96_000, "4ms") => Some(384),
        (96_000, "80us") => Some(8),
        (44_100, "1.09ms") => Some(48),
        (44_100, "0.14ms") => Some(6),
        (44_100, "0.09ms") => Some(4),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaOptions {
    pub provider: String,
    pub num_endpoints: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    pub engine: String,
    pub rdma: Option<RdmaOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub name: Option<String>,
    pub buffer_queue_capacity: u32,
    pub max_payload_size: u32,
    pub max_metadata_size: u32,
    pub conn_creation_delay_ms: u32,
    pub connection: ConnectionType,
    pub options: ConnectionOptions,
    pub payload: PayloadType,
    pub calculated_payload_size: u32,
    pub buf_parts: BufferPartitions,
}

// --- raw (wire-shaped) JSON types, validated and converted into the above ---

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawConnectionConfig {
    name: Option<String>,
    buffer_queue_capacity: Option<u32>,
    max_payload_size: Option<u32>,
    max_metadata_size: Option<u32>,
    conn_creation_delay_milliseconds: Option<u32>,
    connection: RawConnectionSpec,
    options: RawOptions,
    payload: RawPayloadSpec,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawConnectionSpec {
    multipoint_group: Option<RawMultipointGroup>,
    st2110: Option<RawSt2110>,
    rdma: Option<RawRdma>,
}

#[derive(Debug, Deserialize)]
struct RawMultipointGroup {
    urn: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSt2110 {
    ip_addr: String,
    port: u16,
    #[serde(default)]
    mcast_sip_addr: String,
    transport: u8,
    #[serde(default)]
    pacing: String,
    #[serde(default)]
    payload_type: u8,
    #[serde(default)]
    transport_pixel_format: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRdma {
    connection_mode: String,
    max_latency_ns: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawOptions {
    engine: String,
    rdma: Option<RawRdmaOptions>,
}

#[derive(Debug, Deserialize)]
struct RawRdmaOptions {
    provider: String,
    num_endpoints: u8,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawPayloadSpec {
    video: Option<RawVideo>,
    audio: Option<RawAudio>,
    blob: Option<RawBlob>,
}

#[derive(Debug, Deserialize)]
struct RawVideo {
    width: u32,
    height: u32,
    fps: u32,
    pixel_format: String,
}

#[derive(Debug, Deserialize)]
struct RawAudio {
    channels: u32,
    sample_rate: u32,
    format: String,
    packet_time: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawBlob {}

impl ConnectionConfig {
    /// Parses and validates a connection configuration from its JSON
    /// serialization, deriving `calculated_payload_size` and `buf_parts`.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let raw: RawConnectionConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConnectionConfig) -> Result<Self, ConfigError> {
        let connection = parse_connection_type(raw.connection)?;
        let payload = parse_payload_type(raw.payload)?;
        let options = parse_options(raw.options)?;

        validate_compatibility(&connection, &payload)?;

        let max_payload_size = raw.max_payload_size.unwrap_or(0);
        let max_metadata_size = raw.max_metadata_size.unwrap_or(0);

        let calculated_payload_size = calculate_payload_size(&payload, max_payload_size)?;
        let buf_parts = BufferPartitions::new(calculated_payload_size, max_metadata_size);

        Ok(ConnectionConfig {
            name: raw.name,
            buffer_queue_capacity: raw.buffer_queue_capacity.unwrap_or(16),
            max_payload_size,
            max_metadata_size,
            conn_creation_delay_ms: raw.conn_creation_delay_milliseconds.unwrap_or(0),
            connection,
            options,
            payload,
            calculated_payload_size,
            buf_parts,
        })
    }
}

fn parse_connection_type(raw: RawConnectionSpec) -> Result<ConnectionType, ConfigError> {
    let present = [
        raw.multipoint_group.is_some(),
        raw.st2110.is_some(),
        raw.rdma.is_some(),
    ]
    .iter()
    .filter(|p| **p)
    .count();

    if present != 1 {
        return Err(ConfigError::Invalid(
            "exactly one of multipointGroup, st2110, rdma must be set".into(),
        ));
    }

    if let Some(mg) = raw.multipoint_group {
        return Ok(ConnectionType::MultipointGroup { urn: mg.urn });
    }
    if let Some(st) = raw.st2110 {
        return Ok(ConnectionType::St2110 {
            ip_addr: st.ip_addr,
            port: st.port,
            mcast_sip_addr: st.mcast_sip_addr,
            transport: TransportKind::from_u8(st.transport)?,
            pacing: st.pacing,
            payload_type: st.payload_type,
            transport_pixel_format: st.transport_pixel_format,
        });
    }
    let rdma = raw.rdma.expect("checked above");
    Ok(ConnectionType::Rdma {
        connection_mode: rdma.connection_mode,
        max_latency_ns: rdma.max_latency_ns,
    })
}

fn parse_payload_type(raw: RawPayloadSpec) -> Result<PayloadType, ConfigError> {
    let present = [raw.video.is_some(), raw.audio.is_some(), raw.blob.is_some()]
        .iter()
        .filter(|p| **p)
        .count();

    if present != 1 {
        return Err(ConfigError::Invalid(
            "exactly one of video, audio, blob must be set".into(),
        ));
    }

    if let Some(v) = raw.video {
        return Ok(PayloadType::Video {
            width: v.width,
            height: v.height,
            fps: v.fps,
            pixel_format: PixelFormat::parse(&v.pixel_format)?,
        });
    }
    if let Some(a) = raw.audio {
        let format = AudioFormat::parse(&a.format)?;
        if samples_per_packet(a.sample_rate, &a.packet_time).is_none() {
            return Err(ConfigError::Incompatible(format!(
                "sample rate {}Hz is not compatible with packet time {}",
                a.sample_rate, a.packet_time
            )));
        }
        return Ok(PayloadType::Audio {
            channels: a.channels,
            sample_rate: a.sample_rate,
            format,
            packet_time: a.packet_time,
        });
    }
    Ok(PayloadType::Blob)
}

fn parse_options(raw: RawOptions) -> Result<ConnectionOptions, ConfigError> {
    let rdma = match raw.rdma {
        None => None,
        Some(r) => {
            if r.provider != "tcp" && r.provider != "verbs" {
                return Err(ConfigError::Invalid(format!(
                    "unknown rdma provider '{}', expected 'tcp' or 'verbs'",
                    r.provider
                )));
            }
            if !(1..=8).contains(&r.num_endpoints) {
                return Err(ConfigError::Invalid(format!(
                    "rdma num_endpoints {} out of range 1..=8",
                    r.num_endpoints
                )));
            }
            Some(RdmaOptions {
                provider: r.provider,
                num_endpoints: r.num_endpoints,
            })
        }
    };
    if raw.engine != "" && raw.engine != "zero-copy" {
        return Err(ConfigError::Invalid(format!(
            "unknown engine option '{}', expected '' or 'zero-copy'",
            raw.engine
        )));
    }
    Ok(ConnectionOptions {
        engine: raw.engine,
        rdma,
    })
}

fn validate_compatibility(
    connection: &ConnectionType,
    payload: &PayloadType,
) -> Result<(), ConfigError> {
    if matches!(payload, PayloadType::Blob)
        && !matches!(connection, ConnectionType::MultipointGroup { .. })
    {
        return Err(ConfigError::Incompatible(
            "blob payload requires a multipoint_group connection".into(),
        ));
    }
    Ok(())
}

fn calculate_payload_size(
    payload: &PayloadType,
    max_payload_size: u32,
) -> Result<u32, ConfigError> {
    match payload {
        PayloadType::Video {
            width,
            height,
            pixel_format,
            ..
        } => {
            let pixels = width
                .checked_mul(*height)
                .ok_or_else(|| ConfigError::Invalid("width*height overflow".into()))?;
            match pixel_format {
                PixelFormat::Yuv422p10le => Ok(pixels * 4),
                PixelFormat::V210 => {
                    if pixels % 3 != 0 {
                        return Err(ConfigError::Invalid(
                            "v210 requires width*height to be a multiple of 3".into(),
                        ));
                    }
                    Ok(pixels * 8 / 3)
                }
                PixelFormat::Yuv422Rfc4175be10 => {
                    if pixels % 2 != 0 {
                        return Err(ConfigError::Invalid(
                            "yuv422rfc4175be10 requires width*height to be a multiple of 2".into(),
                        ));
                    }
                    Ok(pixels * 5 / 2)
                }
            }
        }
        PayloadType::Audio {
            channels,
            sample_rate,
            format,
            packet_time,
        } => {
            let samples = samples_per_packet(*sample_rate, packet_time).ok_or_else(|| {
                ConfigError::Incompatible(format!(
                    "sample rate {sample_rate}Hz is not compatible with packet time {packet_time}"
                ))
            })?;
            Ok(format.sample_size() * samples * channels)
        }
        PayloadType::Blob => {
            if max_payload_size == 0 {
                return Err(ConfigError::Incompatible(
                    "blob payload requires a non-zero maxPayloadSize".into(),
                ));
            }
            Ok(max_payload_size)
        }
    }
}

/// Top-level client configuration (`Client::create`'s input).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub api_version: String,
    pub proxy_ip: String,
    pub proxy_port: u16,
    pub default_timeout_us: i64,
    pub max_conn_num: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_version: "v1".into(),
            proxy_ip: "127.0.0.1".into(),
            proxy_port: 8002,
            default_timeout_us: 1_000_000,
            max_conn_num: 32,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawClientConfig {
    api_version: Option<String>,
    api_connection_string: Option<String>,
    api_default_timeout_microseconds: Option<i64>,
    max_media_connections: Option<u32>,
}

impl ClientConfig {
    /// Parses the client configuration, applying the documented precedence:
    /// explicit JSON field, then `MCM_MEDIA_PROXY_IP`/`MCM_MEDIA_PROXY_PORT`
    /// environment variables, then the built-in default.
    pub fn parse(json: &str) -> Result<Self, ConfigError> {
        let raw: RawClientConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Self::from_raw(raw, std::env::var, )
    }

    fn from_raw(
        raw: RawClientConfig,
        env_var: impl Fn(&str) -> Result<String, std::env::VarError>,
    ) -> Result<Self, ConfigError> {
        let default = ClientConfig::default();

        let (json_ip, json_port) = match raw.api_connection_string.as_deref() {
            Some(s) => parse_connection_string(s)?,
            None => (None, None),
        };

        let proxy_ip = json_ip
            .or_else(|| env_var("MCM_MEDIA_PROXY_IP").ok())
            .unwrap_or(default.proxy_ip);
        let proxy_port = json_port
            .or_else(|| {
                env_var("MCM_MEDIA_PROXY_PORT")
                    .ok()
                    .and_then(|s| s.parse().ok())
            })
            .unwrap_or(default.proxy_port);

        Ok(ClientConfig {
            api_version: raw.api_version.unwrap_or(default.api_version),
            proxy_ip,
            proxy_port,
            default_timeout_us: raw
                .api_default_timeout_microseconds
                .unwrap_or(default.default_timeout_us),
            max_conn_num: raw.max_media_connections.unwrap_or(default.max_conn_num),
        })
    }
}

/// Parses `"Server=<ip>; Port=<port>"`, tolerating missing fields and
/// surrounding whitespace.
fn parse_connection_string(s: &str) -> Result<(Option<String>, Option<u16>), ConfigError> {
    let mut ip = None;
    let mut port = None;
    for kv in s.split(';') {
        let kv = kv.trim();
        if kv.is_empty() {
            continue;
        }
        let mut parts = kv.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let value = parts.next().unwrap_or("").trim();
        match key.to_ascii_lowercase().as_str() {
            "server" => ip = Some(value.to_string()),
            "port" => {
                port = Some(
                    value
                        .parse()
                        .map_err(|_| ConfigError::Invalid(format!("invalid port '{value}'")))?,
                )
            }
            other => {
                return Err(ConfigError::Invalid(format!(
                    "unknown connection string key '{other}'"
                )))
            }
        }
    }
    Ok((ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn video_json(width: u32, height: u32, pixel_format: &str) -> String {
        format!(
            r#"{{
                "connection": {{ "multipointGroup": {{ "urn": "ipv4:224.0.0.1:20000" }} }},
                "payload": {{ "video": {{ "width": {width}, "height": {height}, "fps": 60, "pixel_format": "{pixel_format}" }} }}
            }}"#
        )
    }

    #[test]
    fn v210_1080p_sizes_to_documented_constant() {
        let cfg = ConnectionConfig::parse(&video_json(1920, 1080, "v210")).unwrap();
        assert_eq!(cfg.calculated_payload_size, 5_529_600);
    }

    #[test]
    fn v210_rejects_non_multiple_of_three_pixel_count() {
        let err = ConnectionConfig::parse(&video_json(7, 1, "v210")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn audio_44100_1ms_is_incompatible() {
        let json = r#"{
            "connection": { "multipointGroup": { "urn": "ipv4:224.0.0.1:20000" } },
            "payload": { "audio": { "channels": 2, "sample_rate": 44100, "format": "pcm_s24be", "packet_time": "1ms" } }
        }"#;
        let err = ConnectionConfig::parse(json).unwrap_err();
        assert!(matches!(err, ConfigError::Incompatible(_)));
    }

    #[test]
    fn audio_44100_109ms_sizes_correctly() {
        let json = r#"{
            "connection": { "multipointGroup": { "urn": "ipv4:224.0.0.1:20000" } },
            "payload": { "audio": { "channels": 2, "sample_rate": 44100, "format": "pcm_s24be", "packet_time": "1.09ms" } }
        }"#;
        let cfg = ConnectionConfig::parse(json).unwrap();
        assert_eq!(cfg.calculated_payload_size, 288);
    }

    #[test]
    fn blob_requires_multipoint_group() {
        let json = r#"{
            "maxPayloadSize": 4096,
            "connection": { "st2110": { "ip_addr": "192.168.1.1", "port": 9001, "transport": 20 } },
            "payload": { "blob": {} }
        }"#;
        let err = ConnectionConfig::parse(json).unwrap_err();
        assert!(matches!(err, ConfigError::Incompatible(_)));
    }

    #[test]
    fn blob_requires_nonzero_max_payload_size() {
        let json = r#"{
            "connection": { "multipointGroup": { "urn": "ipv4:224.0.0.1:20000" } },
            "payload": { "blob": {} }
        }"#;
        let err = ConnectionConfig::parse(json).unwrap_err();
        assert!(matches!(err, ConfigError::Incompatible(_)));
    }

    #[test]
    fn buf_parts_cover_calculated_payload_and_metadata() {
        let cfg = ConnectionConfig::parse(&video_json(1920, 1080, "yuv422p10le")).unwrap();
        assert_eq!(cfg.buf_parts.payload.size, 1920 * 1080 * 4);
        assert_eq!(
            cfg.buf_parts.total_size(),
            cfg.buf_parts.sysdata.size + cfg.buf_parts.payload.size + cfg.buf_parts.metadata.size
        );
    }

    #[test]
    fn client_config_defaults_when_nothing_set() {
        let cfg = ClientConfig::from_raw(RawClientConfig::default(), |_| Err(std::env::VarError::NotPresent)).unwrap();
        assert_eq!(cfg, ClientConfig::default());
    }

    #[test]
    fn client_config_prefers_json_over_env() {
        let raw = RawClientConfig {
            api_connection_string: Some("Server=10.0.0.5; Port=9100".into()),
            ..Default::default()
        };
        let cfg = ClientConfig::from_raw(raw, |key| {
            if key == "MCM_MEDIA_PROXY_IP" {
                Ok("192.168.0.1".into())
            } else {
                Err(std::env::VarError::NotPresent)
            }
        })
        .unwrap();
        assert_eq!(cfg.proxy_ip, "10.0.0.5");
        assert_eq!(cfg.proxy_port, 9100);
    }

    #[test]
    fn client_config_falls_back_to_env_then_default() {
        let cfg = ClientConfig::from_raw(RawClientConfig::default(), |key| {
            if key == "MCM_MEDIA_PROXY_IP" {
                Ok("192.168.0.1".into())
            } else {
                Err(std::env::VarError::NotPresent)
            }
        })
        .unwrap();
        assert_eq!(cfg.proxy_ip, "192.168.0.1");
        assert_eq!(cfg.proxy_port, 8002);
    }
}
