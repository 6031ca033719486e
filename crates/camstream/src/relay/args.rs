//! Transcoder command line construction

use crate::camera::EncoderSettings;
use crate::config::TranscoderConfig;
use crate::media::PixelFormat;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::net::IpAddr;

/// The only crypto suite the accessory protocol accepts
pub const SRTP_SUITE: &str = "AES_CM_128_HMAC_SHA1_80";

/// Where and how the transcoder reads its input
#[derive(Debug, Clone, PartialEq)]
pub enum InputSpec {
    /// SDP on stdin describing loopback RTP ports
    RtpSdp { sdp: String, has_audio: bool },
    /// Raw frames on stdin
    RawFrames {
        format: PixelFormat,
        width: u32,
        height: u32,
        fps: u32,
    },
    /// Stream URL pulled by the transcoder
    Url {
        url: String,
        authorization: Option<String>,
    },
}

impl InputSpec {
    pub fn has_audio(&self) -> bool {
        match self {
            InputSpec::RtpSdp { has_audio, .. } => *has_audio,
            InputSpec::RawFrames { .. } => false,
            InputSpec::Url { .. } => true,
        }
    }
}

/// SRTP destination fixed at prepare time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrtpDestination {
    pub address: IpAddr,
    pub port: u16,
    pub ssrc: u32,
    pub payload_type: u8,
    pub srtp_key: Vec<u8>,
    pub srtp_salt: Vec<u8>,
    pub mtu: u16,
}

impl SrtpDestination {
    /// `-srtp_out_params` value: base64(key || salt)
    pub fn srtp_params(&self) -> String {
        let mut material = Vec::with_capacity(self.srtp_key.len() + self.srtp_salt.len());
        material.extend_from_slice(&self.srtp_key);
        material.extend_from_slice(&self.srtp_salt);
        STANDARD.encode(material)
    }

    pub fn url(&self) -> String {
        let host = match self.address {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => format!("[{}]", v6),
        };
        format!(
            "srtp://{}:{}?rtcpport={}&pkt_size={}",
            host, self.port, self.port, self.mtu
        )
    }
}

/// Audio codecs the accessory protocol negotiates
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AudioCodec {
    Opus,
    AacEld,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoOutput {
    pub destination: SrtpDestination,
    pub settings: EncoderSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioOutput {
    pub destination: SrtpDestination,
    pub codec: AudioCodec,
    pub sample_rate_khz: u32,
    pub bitrate_kbps: u32,
    pub channels: u32,
}

/// What the transcoder produces
#[derive(Debug, Clone, PartialEq)]
pub enum OutputSpec {
    Srtp {
        video: VideoOutput,
        audio: Option<AudioOutput>,
    },
    /// One JPEG frame on stdout
    Jpeg { width: u32, height: u32 },
}

/// Full description of one transcoder invocation
#[derive(Debug, Clone, PartialEq)]
pub struct TranscoderSpec {
    pub input: InputSpec,
    pub output: OutputSpec,
}

/// SDP describing the loopback ports RTP is forwarded to
pub fn loopback_sdp(
    video_port: u16,
    video_pt: u8,
    audio: Option<(u16, u8)>,
) -> String {
    let mut sdp = String::new();
    sdp.push_str("v=0\r\n");
    sdp.push_str("o=- 0 0 IN IP4 127.0.0.1\r\n");
    sdp.push_str("s=camstream\r\n");
    sdp.push_str("c=IN IP4 127.0.0.1\r\n");
    sdp.push_str("t=0 0\r\n");
    sdp.push_str(&format!("m=video {} RTP/AVP {}\r\n", video_port, video_pt));
    sdp.push_str(&format!("a=rtpmap:{} H264/90000\r\n", video_pt));
    sdp.push_str(&format!("a=fmtp:{} packetization-mode=1\r\n", video_pt));
    if let Some((port, pt)) = audio {
        sdp.push_str(&format!("m=audio {} RTP/AVP {}\r\n", port, pt));
        sdp.push_str(&format!("a=rtpmap:{} opus/48000/2\r\n", pt));
    }
    sdp
}

/// Build the argument vector (without the program name)
pub fn build_args(spec: &TranscoderSpec, config: &TranscoderConfig) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |items: &[&str]| args.extend(items.iter().map(|s| s.to_string()));

    push(&["-hide_banner", "-loglevel", &config.log_level]);
    push(&config.extra_input_args.iter().map(String::as_str).collect::<Vec<_>>());

    match &spec.input {
        InputSpec::RtpSdp { .. } => push(&[
            "-protocol_whitelist",
            "pipe,udp,rtp",
            "-fflags",
            "nobuffer",
            "-f",
            "sdp",
            "-i",
            "pipe:0",
        ]),
        InputSpec::RawFrames {
            format,
            width,
            height,
            fps,
        } => push(&[
            "-f",
            "rawvideo",
            "-pix_fmt",
            format.as_ffmpeg(),
            "-s",
            &format!("{}x{}", width, height),
            "-r",
            &fps.to_string(),
            "-i",
            "pipe:0",
        ]),
        InputSpec::Url { url, authorization } => {
            if let Some(auth) = authorization {
                push(&["-headers", &format!("Authorization: {}\r\n", auth)]);
            }
            push(&["-fflags", "nobuffer", "-i", url]);
        }
    }

    match &spec.output {
        OutputSpec::Srtp { video, audio } => {
            args.extend(video_args(video, config));
            if let Some(audio) = audio.as_ref().filter(|_| spec.input.has_audio()) {
                args.extend(audio_args(audio, config));
            }
        }
        OutputSpec::Jpeg { width, height } => {
            args.extend(
                [
                    "-map",
                    "0:v:0",
                    "-an",
                    "-frames:v",
                    "1",
                    "-vf",
                    format!("scale={}:{}", width, height).as_str(),
                    "-f",
                    "image2",
                    "-c:v",
                    "mjpeg",
                    "pipe:1",
                ]
                .iter()
                .map(|s| s.to_string()),
            );
        }
    }

    args
}

fn srtp_args(destination: &SrtpDestination) -> Vec<String> {
    vec![
        "-payload_type".to_string(),
        destination.payload_type.to_string(),
        "-ssrc".to_string(),
        // The muxer takes a signed 32-bit value
        (destination.ssrc as i32).to_string(),
        "-f".to_string(),
        "rtp".to_string(),
        "-srtp_out_suite".to_string(),
        SRTP_SUITE.to_string(),
        "-srtp_out_params".to_string(),
        destination.srtp_params(),
        destination.url(),
    ]
}

fn video_args(video: &VideoOutput, config: &TranscoderConfig) -> Vec<String> {
    let s = &video.settings;
    let mut args: Vec<String> = [
        "-map",
        "0:v:0",
        "-an",
        "-sn",
        "-dn",
        "-c:v",
        config.video_encoder.as_str(),
        "-pix_fmt",
        "yuv420p",
        "-profile:v",
        s.profile.as_ffmpeg(),
        "-level:v",
        s.level.as_ffmpeg(),
        "-preset",
        "ultrafast",
        "-tune",
        "zerolatency",
        "-r",
        s.fps.to_string().as_str(),
        "-vf",
        format!("scale={}:{}", s.width, s.height).as_str(),
        "-b:v",
        format!("{}k", s.bitrate_kbps).as_str(),
        "-maxrate",
        format!("{}k", s.bitrate_kbps).as_str(),
        "-bufsize",
        format!("{}k", s.bitrate_kbps * 2).as_str(),
        "-g",
        (s.fps * 2).to_string().as_str(),
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.extend(srtp_args(&video.destination));
    args
}

fn audio_args(audio: &AudioOutput, config: &TranscoderConfig) -> Vec<String> {
    let mut args: Vec<String> = ["-map", "0:a:0", "-vn", "-sn", "-dn"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    match audio.codec {
        AudioCodec::Opus => args.extend(
            ["-c:a", config.opus_encoder.as_str(), "-application", "lowdelay", "-frame_duration", "20"]
                .iter()
                .map(|s| s.to_string()),
        ),
        AudioCodec::AacEld => args.extend(
            ["-c:a", config.aac_encoder.as_str(), "-profile:a", "aac_eld", "-flags", "+global_header"]
                .iter()
                .map(|s| s.to_string()),
        ),
    }

    args.extend(
        [
            "-ar",
            format!("{}k", audio.sample_rate_khz).as_str(),
            "-b:a",
            format!("{}k", audio.bitrate_kbps).as_str(),
            "-ac",
            audio.channels.to_string().as_str(),
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.extend(srtp_args(&audio.destination));
    args
}
