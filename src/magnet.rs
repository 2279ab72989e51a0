//! Magnet URI parsing (BEP-9's `magnet:?xt=urn:btih:...` links), spec.md
//! §4.6 "Magnet bootstrap".

use url::Url;

use crate::error::{Error, Result};
use crate::Sha1Hash;

/// A parsed magnet link: the info hash it names, plus whatever trackers and
/// display name it carried.
///
/// Base32-encoded (32 character) info hashes are not supported, only the
/// 40-character hex form; DHT/PEX peer discovery is out of scope (spec.md
/// Non-goals), so a magnet link without at least one `tr` tracker parameter
/// is rejected at parse time rather than accepted and left undownloadable.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: Sha1Hash,
    pub display_name: Option<String>,
    trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(Error::InvalidMagnetUri(format!("unsupported scheme {:?}", url.scheme())));
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" => info_hash = Some(parse_exact_topic(&value)?),
                "dn" => display_name = Some(value.into_owned()),
                "tr" => trackers.push(value.into_owned()),
                _ => {}
            }
        }

        let info_hash =
            info_hash.ok_or_else(|| Error::InvalidMagnetUri("missing xt parameter".into()))?;
        if trackers.is_empty() {
            return Err(Error::InvalidMagnetUri(
                "magnet link has no tr tracker parameter; DHT/PEX discovery is not supported".into(),
            ));
        }

        Ok(Self { info_hash, display_name, trackers })
    }

    /// Returns the first tracker named in the magnet link.
    ///
    /// `parse` guarantees at least one is present.
    pub fn announce(&self) -> &str {
        &self.trackers[0]
    }

    pub fn display_name_or_unknown(&self) -> &str {
        self.display_name.as_deref().unwrap_or("unknown")
    }
}

/// Parses the `xt` parameter's `urn:btih:<hex>` exact topic into a raw info
/// hash.
fn parse_exact_topic(xt: &str) -> Result<Sha1Hash> {
    let hex_hash = xt
        .strip_prefix("urn:btih:")
        .ok_or_else(|| Error::InvalidMagnetUri(format!("unsupported xt urn {:?}", xt)))?;
    if hex_hash.len() != 40 {
        return Err(Error::InvalidMagnetUri(
            "only 40-character hex info hashes are supported".into(),
        ));
    }
    let bytes = hex::decode(hex_hash)
        .map_err(|_| Error::InvalidMagnetUri("xt is not valid hex".into()))?;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HASH_HEX: &str = "0123456789abcdef0123456789abcdef01234567";

    #[test]
    fn parses_info_hash_display_name_and_trackers() {
        let hash_hex = &HASH_HEX[..40];
        let uri = format!(
            "magnet:?xt=urn:btih:{}&dn=My+Movie&tr=udp%3A%2F%2Ftracker.example%3A80",
            hash_hex
        );
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(hex::encode(magnet.info_hash), hash_hex);
        assert_eq!(magnet.display_name.as_deref(), Some("My Movie"));
        assert_eq!(magnet.announce(), "udp://tracker.example:80");
    }

    #[test]
    fn falls_back_to_unknown_without_a_display_name() {
        let hash_hex = &HASH_HEX[..40];
        let uri = format!("magnet:?xt=urn:btih:{}&tr=udp%3A%2F%2Ft%3A80", hash_hex);
        let magnet = MagnetLink::parse(&uri).unwrap();
        assert_eq!(magnet.display_name_or_unknown(), "unknown");
    }

    #[test]
    fn rejects_a_magnet_link_with_no_trackers() {
        let hash_hex = &HASH_HEX[..40];
        let uri = format!("magnet:?xt=urn:btih:{}", hash_hex);
        assert!(MagnetLink::parse(&uri).is_err());
    }

    #[test]
    fn rejects_a_non_magnet_scheme() {
        assert!(MagnetLink::parse("http://example.com").is_err());
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(MagnetLink::parse("magnet:?dn=x&tr=udp%3A%2F%2Ft%3A80").is_err());
    }
}
