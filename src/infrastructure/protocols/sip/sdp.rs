//! Simple SDP (Session Description Protocol) handling

use std::fmt;
use std::net::IpAddr;

/// Simple SDP session
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: Option<SdpConnection>,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

impl SdpConnection {
    fn for_ip(ip: IpAddr) -> Self {
        Self {
            network_type: "IN".to_string(),
            address_type: address_type(ip).to_string(),
            address: ip.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,           // "audio", "video"
    pub port: u16,
    pub protocol: String,             // "RTP/AVP"
    pub formats: Vec<String>,         // Codec payload types
    pub rtpmap: Vec<(String, String)>, // (payload_type, encoding)
    pub connection: Option<SdpConnection>,
    pub direction: Option<String>,
}

fn address_type(ip: IpAddr) -> &'static str {
    if ip.is_ipv4() {
        "IP4"
    } else {
        "IP6"
    }
}

/// Static payload type encodings (RFC 3551) plus the usual DTMF mapping
pub fn rtpmap_for(format: &str) -> Option<&'static str> {
    match format {
        "0" => Some("PCMU/8000"),
        "3" => Some("GSM/8000"),
        "8" => Some("PCMA/8000"),
        "9" => Some("G722/8000"),
        "18" => Some("G729/8000"),
        "101" => Some("telephone-event/8000"),
        _ => None,
    }
}

impl SdpSession {
    /// Create an audio offer/answer for the given payload formats
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16, formats: &[String]) -> Self {
        let rtpmap = formats
            .iter()
            .filter_map(|f| rtpmap_for(f).map(|enc| (f.clone(), enc.to_string())))
            .collect();

        Self {
            version: 0,
            origin: SdpOrigin {
                username: "yakphone".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: chrono::Utc::now().timestamp().to_string(),
                network_type: "IN".to_string(),
                address_type: address_type(local_ip).to_string(),
                address: local_ip.to_string(),
            },
            session_name: "yakphone".to_string(),
            connection: Some(SdpConnection::for_ip(local_ip)),
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: formats.to_vec(),
                rtpmap,
                connection: None,
                direction: Some("sendrecv".to_string()),
            }],
        }
    }

    /// Parse SDP from string
    pub fn parse(sdp_body: &str) -> Option<Self> {
        let mut version = 0;
        let mut origin: Option<SdpOrigin> = None;
        let mut session_name = String::new();
        let mut connection: Option<SdpConnection> = None;
        let mut media: Vec<SdpMedia> = Vec::new();
        let mut current_media: Option<SdpMedia> = None;

        for line in sdp_body.lines() {
            let line = line.trim();
            if line.len() < 2 || !line.contains('=') {
                continue;
            }

            let (field_type, value) = line.split_at(2);
            let value = value.trim();

            match field_type {
                "v=" => {
                    version = value.parse().unwrap_or(0);
                }
                "o=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 6 {
                        origin = Some(SdpOrigin {
                            username: parts[0].to_string(),
                            session_id: parts[1].to_string(),
                            session_version: parts[2].to_string(),
                            network_type: parts[3].to_string(),
                            address_type: parts[4].to_string(),
                            address: parts[5].to_string(),
                        });
                    }
                }
                "s=" => {
                    session_name = value.to_string();
                }
                "c=" => {
                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 3 {
                        let conn = SdpConnection {
                            network_type: parts[0].to_string(),
                            address_type: parts[1].to_string(),
                            // strip a multicast TTL suffix
                            address: parts[2].split('/').next().unwrap_or(parts[2]).to_string(),
                        };
                        match current_media.as_mut() {
                            Some(m) => m.connection = Some(conn),
                            None => connection = Some(conn),
                        }
                    }
                }
                "m=" => {
                    if let Some(m) = current_media.take() {
                        media.push(m);
                    }

                    let parts: Vec<&str> = value.split_whitespace().collect();
                    if parts.len() >= 4 {
                        current_media = Some(SdpMedia {
                            media_type: parts[0].to_string(),
                            port: parts[1].split('/').next().and_then(|p| p.parse().ok()).unwrap_or(0),
                            protocol: parts[2].to_string(),
                            formats: parts[3..].iter().map(|s| s.to_string()).collect(),
                            rtpmap: Vec::new(),
                            connection: None,
                            direction: None,
                        });
                    }
                }
                "a=" => {
                    if let Some(media) = current_media.as_mut() {
                        if let Some(rtpmap_value) = value.strip_prefix("rtpmap:") {
                            if let Some((pt, encoding)) = rtpmap_value.split_once(' ') {
                                media.rtpmap.push((pt.to_string(), encoding.to_string()));
                            }
                        } else if matches!(value, "sendrecv" | "sendonly" | "recvonly" | "inactive") {
                            media.direction = Some(value.to_string());
                        }
                    }
                }
                _ => {}
            }
        }

        if let Some(m) = current_media.take() {
            media.push(m);
        }

        Some(Self {
            version,
            origin: origin?,
            session_name,
            connection,
            media,
        })
    }

    /// Get media description for audio
    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    /// Connection address for a media line, falling back to the session one
    pub fn media_address(&self, media: &SdpMedia) -> Option<IpAddr> {
        media
            .connection
            .as_ref()
            .or(self.connection.as_ref())
            .and_then(|c| c.address.parse().ok())
    }

    /// Audio payload types in offer order
    pub fn audio_codecs(&self) -> Vec<u8> {
        self.audio_media()
            .map(|audio| {
                audio
                    .formats
                    .iter()
                    .filter_map(|f| f.parse::<u8>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c={} {} {}\r\n", c.network_type, c.address_type, c.address)?;
        }
        write!(f, "t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            if let Some(c) = &media.connection {
                write!(f, "c={} {} {}\r\n", c.network_type, c.address_type, c.address)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            if let Some(direction) = &media.direction {
                write!(f, "a={}\r\n", direction)?;
            }
        }
        Ok(())
    }
}
