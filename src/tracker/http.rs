//! The HTTP tracker protocol (BEP-3), spec.md §4.3.

use std::net::{Ipv4Addr, SocketAddr};

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};
use serde_bencode::value::Value as BValue;

use super::{parse_compact_peers, PeerAddress};
use crate::{
    error::{Error, Result},
    PeerId, Sha1Hash,
};

/// The characters the tracker spec allows to pass through unescaped; see
/// https://en.wikipedia.org/wiki/Percent-encoding#Types_of_URI_characters.
const URL_ENCODE_RESERVED: &AsciiSet =
    &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'~').remove(b'.');

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    peers: Option<BValue>,
}

/// One peer as sent by the non-compact (list of dictionaries) response form.
#[derive(Debug, Deserialize)]
struct DictPeer {
    ip: String,
    port: u16,
}

/// Normalizes either accepted peer list form into plain addresses: a
/// compact byte string of 6-byte entries (BEP-23), or a list of
/// `{ip, port}` dictionaries (spec.md §4.3: "Both forms must be accepted").
fn parse_peers(value: Option<BValue>) -> Result<Vec<PeerAddress>> {
    match value {
        None => Ok(Vec::new()),
        Some(BValue::Bytes(bytes)) => Ok(parse_compact_peers(&bytes)),
        Some(list @ BValue::List(_)) => {
            let peers: Vec<DictPeer> = serde_bencode::from_bytes(
                &serde_bencode::to_bytes(&list).map_err(|e| Error::Tracker(e.to_string()))?,
            )
            .map_err(|e| Error::Tracker(e.to_string()))?;
            peers
                .into_iter()
                .map(|p| {
                    let ip: Ipv4Addr =
                        p.ip.parse().map_err(|_| Error::Tracker(format!("invalid peer ip {}", p.ip)))?;
                    Ok(PeerAddress(SocketAddr::from((ip, p.port))))
                })
                .collect()
        }
        Some(_) => Err(Error::Tracker("unrecognized peers field shape".into())),
    }
}

/// Announces to an HTTP tracker and returns the compact peer list it sends
/// back (spec.md §4.3 "HTTP tracker").
///
/// `info_hash` and `peer_id` are percent-encoded by hand rather than via
/// `reqwest`'s query serializer, since that serializer requires valid UTF-8
/// and these fields are arbitrary 20-byte strings.
pub(crate) async fn announce(
    announce_url: &str,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    port: u16,
    left: u64,
) -> Result<Vec<PeerAddress>> {
    let separator = if announce_url.contains('?') { '&' } else { '?' };
    let url = format!(
        "{url}{sep}info_hash={info_hash}&peer_id={peer_id}",
        url = announce_url,
        sep = separator,
        info_hash = percent_encoding::percent_encode(&info_hash, URL_ENCODE_RESERVED),
        peer_id = percent_encoding::percent_encode(&peer_id, URL_ENCODE_RESERVED),
    );

    let query = [
        ("port", port.to_string()),
        ("uploaded", "0".to_string()),
        ("downloaded", "0".to_string()),
        ("left", left.to_string()),
        // request a compact peer list; most trackers send one regardless.
        ("compact", "1".to_string()),
    ];

    let body = reqwest::Client::new()
        .get(&url)
        .query(&query)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;

    let response: Response = serde_bencode::from_bytes(&body)?;
    if let Some(reason) = response.failure_reason {
        return Err(Error::Tracker(reason));
    }

    parse_peers(response.peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::mock;

    #[tokio::test]
    async fn parses_a_successful_compact_response() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d5:peers12:");
        body.extend_from_slice(&[127, 0, 0, 1]);
        body.extend_from_slice(&6881u16.to_be_bytes());
        body.extend_from_slice(&[127, 0, 0, 2]);
        body.extend_from_slice(&6882u16.to_be_bytes());
        body.extend_from_slice(b"e");

        let _m = mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create();

        let peers = announce(&mockito::server_url(), [1; 20], [2; 20], 6881, 100).await.unwrap();
        assert_eq!(peers.len(), 2);
    }

    #[tokio::test]
    async fn parses_a_successful_non_compact_response() {
        let body = b"d5:peersld2:ip9:127.0.0.14:porti6881eed2:ip9:127.0.0.24:porti6882eeee".to_vec();

        let _m = mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(body)
            .create();

        let peers = announce(&mockito::server_url(), [1; 20], [2; 20], 6881, 100).await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].0, "127.0.0.1:6881".parse().unwrap());
        assert_eq!(peers[1].0, "127.0.0.2:6882".parse().unwrap());
    }

    #[tokio::test]
    async fn surfaces_a_tracker_failure_reason() {
        let _m = mock("GET", mockito::Matcher::Any)
            .with_status(200)
            .with_body(b"d14:failure reason17:torrent not founde".to_vec())
            .create();

        let err = announce(&mockito::server_url(), [1; 20], [2; 20], 6881, 100).await.unwrap_err();
        assert!(matches!(err, Error::Tracker(_)));
    }
}
