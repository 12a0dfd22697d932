//! Codec Negotiation
//!
//! Handles SDP payload format negotiation between endpoints

/// Codec Information
#[derive(Debug, Clone, PartialEq)]
pub struct CodecInfo {
    pub payload_type: u8,
    pub name: &'static str,
    /// Short name used in logs
    pub alias: &'static str,
    pub clock_rate: u32,
}

impl CodecInfo {
    const fn new(payload_type: u8, name: &'static str, alias: &'static str, clock_rate: u32) -> Self {
        Self {
            payload_type,
            name,
            alias,
            clock_rate,
        }
    }

    /// Get encoding name for rtpmap
    pub fn encoding(&self) -> String {
        format!("{}/{}", self.name, self.clock_rate)
    }

    /// Static RTP/AVP payload types this phone knows about
    pub fn lookup(format: &str) -> Option<&'static CodecInfo> {
        let payload_type: u8 = format.parse().ok()?;
        KNOWN_CODECS.iter().find(|c| c.payload_type == payload_type)
    }
}

static KNOWN_CODECS: &[CodecInfo] = &[
    CodecInfo::new(0, "PCMU", "ulaw", 8000),
    CodecInfo::new(3, "GSM", "gsm", 8000),
    CodecInfo::new(8, "PCMA", "alaw", 8000),
    CodecInfo::new(9, "G722", "g722", 8000),
    CodecInfo::new(18, "G729", "g729", 8000),
    CodecInfo::new(101, "telephone-event", "dtmf", 8000),
];

/// Formats offered when the caller does not restrict them
pub fn default_formats() -> Vec<String> {
    vec!["0".to_string(), "8".to_string()]
}

/// Render formats for logging, e.g. `0(ulaw), 8(alaw)`
pub fn describe_formats(formats: &[String]) -> String {
    formats
        .iter()
        .map(|f| match CodecInfo::lookup(f) {
            Some(codec) => format!("{}({})", f, codec.alias),
            None => f.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Codec Negotiator
#[derive(Debug, Clone)]
pub struct CodecNegotiator {
    supported_formats: Vec<String>,
}

impl CodecNegotiator {
    /// Create negotiator with default supported formats
    pub fn new() -> Self {
        Self::with_formats(default_formats())
    }

    pub fn with_formats(formats: Vec<String>) -> Self {
        Self {
            supported_formats: formats,
        }
    }

    /// Negotiate formats based on an offer
    ///
    /// Returns the formats both sides support, in offer order
    pub fn negotiate(&self, offered: &[String]) -> Vec<String> {
        offered
            .iter()
            .filter(|f| self.supported_formats.contains(f))
            .cloned()
            .collect()
    }

    pub fn supported_formats(&self) -> &[String] {
        &self.supported_formats
    }
}

impl Default for CodecNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn formats(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_codec_info() {
        let codec = CodecInfo::lookup("0").unwrap();
        assert_eq!(codec.name, "PCMU");
        assert_eq!(codec.encoding(), "PCMU/8000");
        assert!(CodecInfo::lookup("96").is_none());
        assert!(CodecInfo::lookup("abc").is_none());
    }

    #[test]
    fn test_codec_negotiation_partial() {
        let negotiator = CodecNegotiator::new();

        // 97 is not supported
        let negotiated = negotiator.negotiate(&formats(&["8", "97"]));
        assert_eq!(negotiated, formats(&["8"]));
    }

    #[test]
    fn test_negotiation_keeps_offer_order() {
        let negotiator = CodecNegotiator::new();
        assert_eq!(negotiator.negotiate(&formats(&["8", "0"])), formats(&["8", "0"]));
    }

    #[test]
    fn test_restricted_negotiator() {
        let negotiator = CodecNegotiator::with_formats(formats(&["8"]));
        assert!(negotiator.negotiate(&formats(&["0"])).is_empty());
    }

    #[test]
    fn test_describe_formats() {
        assert_eq!(describe_formats(&default_formats()), "0(ulaw), 8(alaw)");
        assert_eq!(describe_formats(&formats(&["96", "101"])), "96, 101(dtmf)");
    }
}
