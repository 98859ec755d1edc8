//! BEP-9 magnet URI parsing.
//!
//! Extracts the info hash (hex or base32 form), display name, tracker list
//! and explicit peer hints (`x.pe=`) from a magnet link, and can re-render
//! the link with a fallback tracker list appended.

use std::net::SocketAddr;

use tracing::debug;
use url::form_urlencoded;

use super::TorrentError;

/// Parsed magnet link.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    /// Canonical info hash: 40 lowercase hex digits
    pub info_hash: String,
    /// `dn=` display name, percent-decoded
    pub display_name: Option<String>,
    /// `tr=` tracker URIs in announcement order
    pub trackers: Vec<String>,
    /// `x.pe=` explicit peer hints that parsed as socket addresses
    pub peer_hints: Vec<SocketAddr>,
    raw: String,
}

impl MagnetLink {
    /// Parses a magnet URI.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidMagnet` - not a magnet URI, or no valid
    ///   `xt=urn:btih:` info hash in hex (40) or base32 (32) form
    pub fn parse(uri: &str) -> Result<Self, TorrentError> {
        let uri = uri.trim();
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| TorrentError::InvalidMagnet {
                reason: "missing magnet:? scheme".to_string(),
            })?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        let mut peer_hints = Vec::new();

        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "xt" => {
                    if let Some(hash) = value.strip_prefix("urn:btih:") {
                        if let Some(hex) = normalize_info_hash(hash) {
                            info_hash = Some(hex);
                        }
                    }
                }
                "dn" => display_name = Some(value.to_string()),
                "tr" => trackers.push(value.to_string()),
                "x.pe" => match value.parse::<SocketAddr>() {
                    Ok(addr) => peer_hints.push(addr),
                    Err(_) => debug!("Ignoring unparseable peer hint: {}", value),
                },
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| TorrentError::InvalidMagnet {
            reason: "missing or invalid info hash".to_string(),
        })?;

        Ok(Self {
            info_hash,
            display_name,
            trackers,
            peer_hints,
            raw: uri.to_string(),
        })
    }

    /// The URI exactly as submitted.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Re-renders the URI with `extra` trackers appended as `tr=` params,
    /// skipping any already present. The engine then announces to the
    /// union of the magnet's own trackers and the fallback list.
    pub fn with_extra_trackers(&self, extra: &[String]) -> String {
        let mut uri = self.raw.clone();
        for tracker in extra {
            if self.trackers.iter().any(|t| t == tracker) {
                continue;
            }
            let encoded: String = form_urlencoded::byte_serialize(tracker.as_bytes()).collect();
            uri.push_str("&tr=");
            uri.push_str(&encoded);
        }
        uri
    }
}

/// Normalizes an info hash to 40 lowercase hex digits, accepting the hex
/// (40 chars) and base32 (32 chars, RFC 4648) magnet forms.
fn normalize_info_hash(hash: &str) -> Option<String> {
    let hash = hash.trim();
    if hash.len() == 40 && hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return Some(hash.to_ascii_lowercase());
    }
    if hash.len() == 32 {
        let bytes = decode_base32(&hash.to_ascii_uppercase())?;
        return Some(bytes.iter().map(|b| format!("{b:02x}")).collect());
    }
    None
}

/// RFC 4648 base32 decode for the 32-character info hash form.
fn decode_base32(input: &str) -> Option<Vec<u8>> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut bits = 0u64;
    let mut bit_count = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);

    for c in input.bytes() {
        let value = ALPHABET.iter().position(|&a| a == c)? as u64;
        bits = (bits << 5) | value;
        bit_count += 5;
        if bit_count >= 8 {
            bit_count -= 8;
            out.push((bits >> bit_count) as u8);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX_HASH: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn test_parse_hex_magnet() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX_HASH}&dn=Test%20Movie&tr=udp%3A%2F%2Ftracker.example.com%3A80%2Fannounce"
        );
        let magnet = MagnetLink::parse(&uri).unwrap();

        assert_eq!(magnet.info_hash, HEX_HASH);
        assert_eq!(magnet.display_name.as_deref(), Some("Test Movie"));
        assert_eq!(magnet.trackers, vec!["udp://tracker.example.com:80/announce"]);
        assert!(magnet.peer_hints.is_empty());
    }

    #[test]
    fn test_parse_uppercase_hex_is_normalized() {
        let uri = format!("magnet:?xt=urn:btih:{}", HEX_HASH.to_uppercase());
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.info_hash, HEX_HASH);
    }

    #[test]
    fn test_parse_base32_magnet() {
        // base32 of 20 bytes of 0x00..0x13
        let uri = "magnet:?xt=urn:btih:AAAQEAYEAUDAOCAJBIFQYDIOB4IBCEQT";
        let magnet = MagnetLink::parse(uri).unwrap();
        assert_eq!(magnet.info_hash.len(), 40);
        assert_eq!(
            magnet.info_hash,
            "000102030405060708090a0b0c0d0e0f10111213"
        );
    }

    #[test]
    fn test_parse_peer_hints() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX_HASH}&x.pe=10.1.2.3%3A6881&x.pe=not-an-addr"
        );
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.peer_hints, vec!["10.1.2.3:6881".parse().unwrap()]);
    }

    #[test]
    fn test_reject_missing_scheme() {
        let result = MagnetLink::parse("http://example.com/file.torrent");
        assert!(matches!(result, Err(TorrentError::InvalidMagnet { .. })));
    }

    #[test]
    fn test_reject_short_hash() {
        let result = MagnetLink::parse("magnet:?xt=urn:btih:tooshort");
        assert!(matches!(result, Err(TorrentError::InvalidMagnet { .. })));
    }

    #[test]
    fn test_extra_trackers_skip_duplicates() {
        let uri = format!(
            "magnet:?xt=urn:btih:{HEX_HASH}&tr=udp%3A%2F%2Fa%3A1%2Fannounce"
        );
        let magnet = MagnetLink::parse(&uri).unwrap();

        let rendered = magnet.with_extra_trackers(&[
            "udp://a:1/announce".to_string(),
            "udp://b:2/announce".to_string(),
        ]);

        assert_eq!(rendered.matches("tr=").count(), 2);
        assert!(rendered.contains("udp%3A%2F%2Fb%3A2%2Fannounce"));
    }
}
