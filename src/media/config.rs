#![forbid(unsafe_code)]

// Worker-pool, router-codec, and WebRTC transport settings for the
// media engine

use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use std::net::{IpAddr, Ipv4Addr};
use std::num::{NonZeroU32, NonZeroU8};

/// Top-level media engine settings
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub worker: WorkerConfig,
    pub router: RouterConfig,
    pub transport: TransportConfig,
}

/// Sizing and logging for the worker pool, plus the RTC media port range
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<WorkerLogTag>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: vec![
                WorkerLogTag::Info,
                WorkerLogTag::Ice,
                WorkerLogTag::Dtls,
                WorkerLogTag::Rtp,
                WorkerLogTag::Rtcp,
            ],
            rtc_min_port: 10000,
            rtc_max_port: 10100,
        }
    }
}

impl WorkerConfig {
    /// Lowers into the engine's WorkerSettings
    pub fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();

        settings.log_level = self.log_level;
        settings.log_tags = self.log_tags.clone();
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;

        settings
    }
}

/// Codec capabilities every room router advertises
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Returns the codec capabilities advertised to every room
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            // Audio
            RtpCodecCapability::Audio {
                mime_type: MimeTypeAudio::Opus,
                preferred_payload_type: Some(111),
                clock_rate: NonZeroU32::new(48000).unwrap(),
                channels: NonZeroU8::new(2).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("minptime", 10_u32.into()),
                    ("useinbandfec", 1_u32.into()),
                ]),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            },
            // Video - VP8
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp8,
                preferred_payload_type: Some(96),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("x-google-start-bitrate", 1000_u32.into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            // Video - VP9
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::Vp9,
                preferred_payload_type: Some(98),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("profile-id", 2_u32.into()),
                    ("x-google-start-bitrate", 1000_u32.into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
            // Video - H264
            RtpCodecCapability::Video {
                mime_type: MimeTypeVideo::H264,
                preferred_payload_type: Some(102),
                clock_rate: NonZeroU32::new(90000).unwrap(),
                parameters: RtpCodecParametersParameters::from([
                    ("level-asymmetry-allowed", 1_u32.into()),
                    ("packetization-mode", 1_u32.into()),
                    ("profile-level-id", "4d0032".into()),
                    ("x-google-start-bitrate", 1000_u32.into()),
                ]),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            },
        ]
    }

    /// Lowers into the engine's RouterOptions
    pub fn to_router_options(&self) -> RouterOptions {
        RouterOptions::new(self.media_codecs.clone())
    }
}

/// Listen-address, protocol, and bitrate settings for WebRTC transports
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub initial_available_outgoing_bitrate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 600_000,
        }
    }
}

impl TransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_announced_ip(mut self, announced_ip: IpAddr) -> Self {
        self.announced_ip = Some(announced_ip);
        self
    }

    fn listen_info(&self, protocol: Protocol) -> ListenInfo {
        ListenInfo {
            protocol,
            ip: self.listen_ip,
            announced_address: self.announced_ip.map(|ip| ip.to_string()),
            port: None,
            port_range: None,
            flags: None,
            send_buffer_size: None,
            recv_buffer_size: None,
            expose_internal_ip: false,
        }
    }

    /// Builds the listen-info list, preferred protocol first.
    /// Falls back to UDP when both protocols are disabled.
    pub fn listen_infos(&self) -> WebRtcTransportListenInfos {
        match (self.enable_udp, self.enable_tcp) {
            (true, true) if self.prefer_udp => {
                WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp))
                    .insert(self.listen_info(Protocol::Tcp))
            }
            (true, true) => WebRtcTransportListenInfos::new(self.listen_info(Protocol::Tcp))
                .insert(self.listen_info(Protocol::Udp)),
            (false, true) => WebRtcTransportListenInfos::new(self.listen_info(Protocol::Tcp)),
            _ => WebRtcTransportListenInfos::new(self.listen_info(Protocol::Udp)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codecs_cover_all_advertised_kinds() {
        let codecs = RouterConfig::default_codecs();
        assert_eq!(codecs.len(), 4);

        let opus = &codecs[0];
        match opus {
            RtpCodecCapability::Audio {
                mime_type,
                clock_rate,
                channels,
                ..
            } => {
                assert_eq!(*mime_type, MimeTypeAudio::Opus);
                assert_eq!(clock_rate.get(), 48000);
                assert_eq!(channels.get(), 2);
            }
            RtpCodecCapability::Video { .. } => panic!("first codec must be audio"),
        }

        let video_mimes: Vec<_> = codecs[1..]
            .iter()
            .map(|c| match c {
                RtpCodecCapability::Video { mime_type, .. } => *mime_type,
                RtpCodecCapability::Audio { .. } => panic!("expected video codec"),
            })
            .collect();
        assert_eq!(
            video_mimes,
            vec![MimeTypeVideo::Vp8, MimeTypeVideo::Vp9, MimeTypeVideo::H264]
        );
    }

    #[test]
    fn h264_profile_matches_deployment() {
        let codecs = RouterConfig::default_codecs();
        let h264 = codecs
            .iter()
            .find_map(|c| match c {
                RtpCodecCapability::Video {
                    mime_type: MimeTypeVideo::H264,
                    parameters,
                    ..
                } => Some(parameters.clone()),
                _ => None,
            })
            .expect("H264 must be advertised");
        let json = serde_json::to_value(&h264).unwrap();
        assert_eq!(json["profile-level-id"], "4d0032");
        assert_eq!(json["packetization-mode"], 1);
        assert_eq!(json["level-asymmetry-allowed"], 1);
    }

    #[test]
    fn worker_ports_stay_in_media_range() {
        let config = WorkerConfig::default();
        assert_eq!(config.rtc_min_port, 10000);
        assert_eq!(config.rtc_max_port, 10100);
    }

    #[test]
    fn udp_listed_first_when_preferred() {
        let config = TransportConfig::default();
        assert!(config.enable_udp && config.enable_tcp && config.prefer_udp);
        // Both protocols disabled still yields a UDP listen info
        let no_protocols = TransportConfig {
            enable_udp: false,
            enable_tcp: false,
            ..TransportConfig::default()
        };
        let _ = no_protocols.listen_infos();
    }
}
