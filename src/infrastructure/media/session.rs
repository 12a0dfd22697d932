//! Media session
//!
//! Owns the local RTP socket and the offer/answer state of one call leg.
//! Packet flow is left to the application.

use super::codec::{default_formats, describe_formats, CodecNegotiator};
use crate::infrastructure::protocols::sip::sdp::SdpSession;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Failed to bind RTP socket: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),

    #[error("No audio media in SDP")]
    NoAudio,

    #[error("No common codec format, remote offered {0}")]
    NoCommonFormat(String),
}

/// RTP endpoint plus negotiated SDP state
#[derive(Debug, Clone)]
pub struct MediaSession {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    remote_addr: Option<SocketAddr>,
    negotiator: CodecNegotiator,
    formats: Vec<String>,
    remote_sdp: Option<SdpSession>,
}

impl MediaSession {
    /// Bind an RTP socket on `ip` with an ephemeral port
    pub async fn new(ip: IpAddr) -> Result<Self, MediaError> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        debug!("RTP socket bound to {}", local_addr);

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            remote_addr: None,
            negotiator: CodecNegotiator::new(),
            formats: default_formats(),
            remote_sdp: None,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn remote_sdp(&self) -> Option<&SdpSession> {
        self.remote_sdp.as_ref()
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }

    /// Current formats: the offer before negotiation, the agreed set after
    pub fn formats(&self) -> &[String] {
        &self.formats
    }

    /// Restrict the formats this session offers and accepts
    pub fn set_formats(&mut self, formats: Vec<String>) {
        if formats.is_empty() {
            return;
        }
        self.negotiator = CodecNegotiator::with_formats(formats.clone());
        self.formats = formats;
    }

    pub fn log_formats(&self) -> String {
        describe_formats(&self.formats)
    }

    /// Local session description
    pub fn local_sdp(&self) -> Vec<u8> {
        SdpSession::create_audio_session(self.local_addr.ip(), self.local_addr.port(), &self.formats)
            .to_string()
            .into_bytes()
    }

    /// Absorb the remote description
    pub fn apply_remote_sdp(&mut self, body: &[u8]) -> Result<(), MediaError> {
        let text = std::str::from_utf8(body).map_err(|e| MediaError::InvalidSdp(e.to_string()))?;
        let sdp = SdpSession::parse(text)
            .ok_or_else(|| MediaError::InvalidSdp("missing origin line".to_string()))?;
        let audio = sdp.audio_media().ok_or(MediaError::NoAudio)?;
        let ip = sdp
            .media_address(audio)
            .ok_or_else(|| MediaError::InvalidSdp("missing connection address".to_string()))?;

        let common = self.negotiator.negotiate(&audio.formats);
        if common.is_empty() {
            return Err(MediaError::NoCommonFormat(describe_formats(&audio.formats)));
        }

        let remote = SocketAddr::new(ip, audio.port);
        info!(remote = %remote, formats = %describe_formats(&common), "Media negotiated");
        self.formats = common;
        self.remote_addr = Some(remote);
        self.remote_sdp = Some(sdp);
        Ok(())
    }

    /// Copy for a re-negotiation; the RTP socket is shared
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Release this handle on the RTP socket
    pub fn close(self) {
        debug!("Media session on {} closed", self.local_addr);
    }
}
