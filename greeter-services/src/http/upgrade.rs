//! Cleartext HTTP/2 negotiation.
//!
//! A cleartext connection reaches HTTP/2 in one of two ways:
//!
//! - Prior knowledge: the client opens with the HTTP/2 connection preface
//!   ([`PREFACE`]). The bytes are replayed untouched to the HTTP/2 server.
//! - `Upgrade: h2c` (RFC 7540 section 3.2): the first HTTP/1.1 request offers the upgrade.
//!   The server answers `101 Switching Protocols`, reads the client preface and its first
//!   SETTINGS frame, then injects a HEADERS frame on stream 1 that carries the original
//!   request line. The HTTP/2 server sees an ordinary connection whose first stream is the
//!   upgraded request.
//!
//! Anything else continues as HTTP/1.1. The bytes read while sniffing are replayed in front
//! of the socket with [`PrefixedReadIo`], so the HTTP/1.1 decoder sees the request from its
//! first byte. A malformed or incomplete offer is handled the same way.
use std::{
    io::{self, Cursor},
    time::Duration,
};

use base64ct::{Base64Url, Base64UrlUnpadded, Encoding};
use greeter_core::{context::NegotiationRoute, http::HttpVersion};
use monoio::{
    buf::IoBufMut,
    io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, PrefixedReadIo},
};
use tracing::{debug, info};

/// The HTTP/2 client connection preface.
pub const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const UPGRADE_TOKEN: &str = "h2c";
const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";

const FRAME_HEADER_LEN: usize = 9;
const FRAME_TYPE_HEADERS: u8 = 0x1;
const FRAME_TYPE_SETTINGS: u8 = 0x4;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
const SETTING_LEN: usize = 6;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// A stream whose first bytes are replayed from memory.
pub type UpgradedIo<IO> = PrefixedReadIo<IO, Cursor<Vec<u8>>>;

#[derive(thiserror::Error, Debug)]
pub enum UpgradeError {
    #[error("io error: {0:?}")]
    Io(#[from] io::Error),
    #[error("connection closed before the http/2 preface")]
    PrefaceMissing,
    #[error("invalid http/2 connection preface after upgrade")]
    InvalidPreface,
    #[error("first http/2 frame is of type {0:#x}, expected SETTINGS")]
    SettingsExpected(u8),
    #[error("SETTINGS frame of {0} bytes exceeds the default max frame size")]
    FrameTooLarge(usize),
    #[error("peer sent nothing for {0:?}")]
    Idle(Duration),
}

/// Result of inspecting the first bytes of a cleartext connection.
#[derive(Debug, PartialEq, Eq)]
enum Sniffed {
    PriorKnowledge,
    /// A complete HTTP/1.x head of `head_len` bytes.
    Http1 { head_len: usize },
    /// Malformed, oversized or truncated; left for the HTTP/1.1 decoder to judge.
    Unparsed,
}

/// The request line of an accepted `Upgrade: h2c` offer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeOffer {
    pub method: String,
    pub path: String,
    pub authority: Option<String>,
}

/// Decides the protocol of a cleartext connection.
///
/// Returns the selected version, the route that led to it and the stream to hand to the
/// protocol codec. Every read waits at most `idle`; a silent peer ends the connection with
/// [`UpgradeError::Idle`]. Apart from that, only an accepted upgrade whose follow-up is not
/// valid HTTP/2 yields an error, and every other outcome falls back to HTTP/1.1.
pub async fn negotiate<IO>(
    mut io: IO,
    max_head_size: usize,
    idle: Duration,
) -> Result<(HttpVersion, NegotiationRoute, UpgradedIo<IO>), UpgradeError>
where
    IO: AsyncReadRent + AsyncWriteRent,
{
    let mut buf = Vec::with_capacity(READ_CHUNK);
    let sniffed = loop {
        if let Some(sniffed) = sniff(&buf, max_head_size) {
            break sniffed;
        }
        let (n, b) = read_within(&mut io, buf, idle).await?;
        buf = b;
        if n == 0 {
            break Sniffed::Unparsed;
        }
    };

    match sniffed {
        Sniffed::PriorKnowledge => {
            info!("talking HTTP/2 with prior knowledge");
            Ok((
                HttpVersion::Http2,
                NegotiationRoute::PriorKnowledge,
                PrefixedReadIo::new(io, Cursor::new(buf)),
            ))
        }
        Sniffed::Http1 { head_len } => {
            let stream_one = upgrade_offer(&buf[..head_len])
                .and_then(|offer| synthesize_headers_frame(&offer));
            match stream_one {
                Some(frame) => {
                    let rest = buf.split_off(head_len);
                    upgrade(io, rest, frame, idle).await
                }
                None => Ok(direct(io, buf)),
            }
        }
        Sniffed::Unparsed => Ok(direct(io, buf)),
    }
}

fn direct<IO>(io: IO, buf: Vec<u8>) -> (HttpVersion, NegotiationRoute, UpgradedIo<IO>) {
    info!("directly talking: HTTP/1.1 (no upgrade was attempted)");
    (
        HttpVersion::Http11,
        NegotiationRoute::Direct,
        PrefixedReadIo::new(io, Cursor::new(buf)),
    )
}

async fn upgrade<IO>(
    mut io: IO,
    mut buf: Vec<u8>,
    stream_one: Vec<u8>,
    idle: Duration,
) -> Result<(HttpVersion, NegotiationRoute, UpgradedIo<IO>), UpgradeError>
where
    IO: AsyncReadRent + AsyncWriteRent,
{
    let (res, _) = io.write_all(SWITCHING_PROTOCOLS).await;
    res?;
    io.flush().await?;
    debug!("upgrade event: h2c accepted, waiting for the client preface");

    let settings_end = loop {
        if let Some(end) = client_preface_end(&buf)? {
            break end;
        }
        let (n, b) = read_within(&mut io, buf, idle).await?;
        buf = b;
        if n == 0 {
            return Err(UpgradeError::PrefaceMissing);
        }
    };

    // preface + SETTINGS, then the upgraded request as stream 1, then whatever followed
    let rest = buf.split_off(settings_end);
    buf.extend_from_slice(&stream_one);
    buf.extend_from_slice(&rest);
    info!("upgraded to HTTP/2 over cleartext, replaying the request as stream 1");
    Ok((
        HttpVersion::Http2,
        NegotiationRoute::CleartextUpgrade,
        PrefixedReadIo::new(io, Cursor::new(buf)),
    ))
}

async fn read_within<IO: AsyncReadRent>(
    io: &mut IO,
    buf: Vec<u8>,
    idle: Duration,
) -> Result<(usize, Vec<u8>), UpgradeError> {
    match monoio::time::timeout(idle, read_more(io, buf)).await {
        Ok((res, buf)) => Ok((res?, buf)),
        Err(_) => Err(UpgradeError::Idle(idle)),
    }
}

async fn read_more<IO: AsyncReadRent>(io: &mut IO, mut buf: Vec<u8>) -> (io::Result<usize>, Vec<u8>) {
    if buf.capacity() - buf.len() < READ_CHUNK {
        buf.reserve(READ_CHUNK);
    }
    let (len, cap) = (buf.len(), buf.capacity());
    let (res, slice) = io.read(buf.slice_mut(len..cap)).await;
    (res, slice.into_inner())
}

/// `None` means more bytes are needed.
fn sniff(buf: &[u8], max_head_size: usize) -> Option<Sniffed> {
    let n = buf.len().min(PREFACE.len());
    if buf[..n] == PREFACE[..n] {
        return (n == PREFACE.len()).then_some(Sniffed::PriorKnowledge);
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => Some(Sniffed::Http1 { head_len }),
        Ok(httparse::Status::Partial) if buf.len() < max_head_size => None,
        Ok(httparse::Status::Partial) => Some(Sniffed::Unparsed),
        Err(e) => {
            debug!("initial request does not parse ({e}), leaving it to the http/1.1 codec");
            Some(Sniffed::Unparsed)
        }
    }
}

/// Extracts a valid `Upgrade: h2c` offer from a complete request head.
pub fn upgrade_offer(head: &[u8]) -> Option<UpgradeOffer> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        _ => return None,
    }

    let mut upgrade = false;
    let mut settings = 0usize;
    let mut settings_valid = false;
    let mut connection_upgrade = false;
    let mut connection_settings = false;
    let mut has_body = false;
    let mut authority = None;
    for header in req.headers.iter() {
        let name = header.name;
        let value = std::str::from_utf8(header.value).ok()?;
        if name.eq_ignore_ascii_case("upgrade") {
            upgrade |= has_token(value, UPGRADE_TOKEN);
        } else if name.eq_ignore_ascii_case("http2-settings") {
            settings += 1;
            settings_valid = is_valid_settings(value);
        } else if name.eq_ignore_ascii_case("connection") {
            connection_upgrade |= has_token(value, "upgrade");
            connection_settings |= has_token(value, "http2-settings");
        } else if name.eq_ignore_ascii_case("content-length") {
            has_body |= value.trim() != "0";
        } else if name.eq_ignore_ascii_case("transfer-encoding") {
            has_body = true;
        } else if name.eq_ignore_ascii_case("host") {
            authority = Some(value.trim().to_string());
        }
    }

    if !upgrade {
        return None;
    }
    if req.version != Some(1) {
        debug!("ignoring h2c upgrade offer on HTTP/1.0");
        return None;
    }
    if settings != 1 || !settings_valid {
        debug!("ignoring h2c upgrade offer without a single valid HTTP2-Settings header");
        return None;
    }
    if !(connection_upgrade && connection_settings) {
        debug!("ignoring h2c upgrade offer: Connection must list Upgrade and HTTP2-Settings");
        return None;
    }
    if has_body {
        debug!("ignoring h2c upgrade offer carrying a request body");
        return None;
    }

    Some(UpgradeOffer {
        method: req.method?.to_string(),
        path: req.path?.to_string(),
        authority: authority.filter(|a| !a.is_empty()),
    })
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// `HTTP2-Settings` carries a base64url SETTINGS payload: a sequence of 6-byte entries.
fn is_valid_settings(value: &str) -> bool {
    let value = value.trim();
    let decoded = Base64UrlUnpadded::decode_vec(value).or_else(|_| Base64Url::decode_vec(value));
    matches!(decoded, Ok(payload) if payload.len() % SETTING_LEN == 0)
}

/// Encodes the HEADERS frame that replays `offer` as stream 1.
///
/// Only pseudo-headers are encoded. Their names are all in the HPACK static table, so the
/// block never inserts into the dynamic table the client's encoder shares with the server.
/// Returns `None` if the block does not fit a single frame of the default size.
pub fn synthesize_headers_frame(offer: &UpgradeOffer) -> Option<Vec<u8>> {
    let mut fields: Vec<(&[u8], &[u8])> = vec![
        (b":method", offer.method.as_bytes()),
        (b":path", offer.path.as_bytes()),
        (b":scheme", b"http"),
    ];
    if let Some(authority) = &offer.authority {
        fields.push((b":authority", authority.as_bytes()));
    }

    let mut block = Vec::new();
    hpack::Encoder::new().encode_into(fields, &mut block).ok()?;
    if block.len() > DEFAULT_MAX_FRAME_SIZE {
        debug!("upgraded request head of {} bytes does not fit one frame", block.len());
        return None;
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + block.len());
    frame.extend_from_slice(&(block.len() as u32).to_be_bytes()[1..]);
    frame.push(FRAME_TYPE_HEADERS);
    frame.push(FLAG_END_STREAM | FLAG_END_HEADERS);
    frame.extend_from_slice(&1u32.to_be_bytes());
    frame.extend_from_slice(&block);
    Some(frame)
}

/// Length of the client preface plus its first SETTINGS frame, once fully buffered.
fn client_preface_end(buf: &[u8]) -> Result<Option<usize>, UpgradeError> {
    let n = buf.len().min(PREFACE.len());
    if buf[..n] != PREFACE[..n] {
        return Err(UpgradeError::InvalidPreface);
    }
    let Some(header) = buf.get(PREFACE.len()..PREFACE.len() + FRAME_HEADER_LEN) else {
        return Ok(None);
    };
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    if header[3] != FRAME_TYPE_SETTINGS {
        return Err(UpgradeError::SettingsExpected(header[3]));
    }
    if len > DEFAULT_MAX_FRAME_SIZE {
        return Err(UpgradeError::FrameTooLarge(len));
    }
    let end = PREFACE.len() + FRAME_HEADER_LEN + len;
    Ok((buf.len() >= end).then_some(end))
}

#[cfg(test)]
mod tests {
    use monoio::net::{TcpListener, TcpStream};

    use super::*;

    const CURL_UPGRADE: &[u8] = b"GET /index.html HTTP/1.1\r\n\
        Host: 127.0.0.1:8080\r\n\
        User-Agent: curl/8.5.0\r\n\
        Accept: */*\r\n\
        Connection: Upgrade, HTTP2-Settings\r\n\
        Upgrade: h2c\r\n\
        HTTP2-Settings: AAMAAABkAAQAoAAAAAIAAAAA\r\n\r\n";

    fn offer_with(extra: &str) -> Option<UpgradeOffer> {
        let head = format!(
            "GET / HTTP/1.1\r\nHost: example.com\r\n{extra}\r\n",
        );
        upgrade_offer(head.as_bytes())
    }

    #[test]
    fn sniff_waits_for_full_preface() {
        assert_eq!(sniff(b"", 8192), None);
        assert_eq!(sniff(&PREFACE[..10], 8192), None);
        assert_eq!(sniff(PREFACE, 8192), Some(Sniffed::PriorKnowledge));
    }

    #[test]
    fn sniff_reports_complete_http1_head() {
        let req = b"GET / HTTP/1.1\r\nHost: a\r\n\r\nleftover";
        assert_eq!(sniff(req, 8192), Some(Sniffed::Http1 { head_len: 27 }));
        assert_eq!(sniff(b"GET / HTTP/1.1\r\nHost:", 8192), None);
    }

    #[test]
    fn sniff_gives_up_on_garbage_and_oversized_heads() {
        assert_eq!(sniff(b"\x16\x03\x01\x02\x00", 8192), Some(Sniffed::Unparsed));
        assert_eq!(sniff(b"GET / HTTP/1.1\r\nHost:", 16), Some(Sniffed::Unparsed));
    }

    #[test]
    fn curl_style_offer_is_accepted() {
        let offer = upgrade_offer(CURL_UPGRADE).unwrap();
        assert_eq!(
            offer,
            UpgradeOffer {
                method: "GET".to_string(),
                path: "/index.html".to_string(),
                authority: Some("127.0.0.1:8080".to_string()),
            }
        );
    }

    #[test]
    fn offer_requires_every_piece() {
        let settings = "HTTP2-Settings: AAMAAABkAAQAoAAAAAIAAAAA\r\n";
        let full = format!("Connection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\n{settings}");
        assert!(offer_with(&full).is_some());

        // no upgrade header at all
        assert!(offer_with("").is_none());
        // another protocol
        assert!(offer_with(&full.replace("h2c", "websocket")).is_none());
        // settings missing
        assert!(offer_with(&full.replace(settings, "")).is_none());
        // Connection does not list HTTP2-Settings
        assert!(offer_with(&full.replace("Upgrade, HTTP2-Settings", "Upgrade")).is_none());
        // duplicated settings
        assert!(offer_with(&format!("{full}{settings}")).is_none());
        // body present
        assert!(offer_with(&format!("{full}Content-Length: 5\r\n")).is_none());
        assert!(offer_with(&format!("{full}Transfer-Encoding: chunked\r\n")).is_none());
        // an empty body is fine
        assert!(offer_with(&format!("{full}Content-Length: 0\r\n")).is_some());
    }

    #[test]
    fn offer_tokens_are_case_insensitive() {
        let offer = offer_with(
            "connection: keep-alive, upgrade, http2-settings\r\n\
             upgrade: H2C\r\n\
             http2-settings: \r\n",
        );
        assert!(offer.is_some());
    }

    #[test]
    fn offer_on_http10_is_ignored() {
        let head = b"GET / HTTP/1.0\r\nConnection: Upgrade, HTTP2-Settings\r\n\
            Upgrade: h2c\r\nHTTP2-Settings: AAMAAABkAAQAoAAAAAIAAAAA\r\n\r\n";
        assert!(upgrade_offer(head).is_none());
    }

    #[test]
    fn settings_payload_must_be_whole_entries() {
        assert!(is_valid_settings("AAMAAABkAAQAoAAAAAIAAAAA"));
        assert!(is_valid_settings(""));
        // 4 bytes, not a multiple of 6
        assert!(!is_valid_settings("AAMAAA"));
        assert!(!is_valid_settings("not base64!"));
    }

    #[test]
    fn headers_frame_replays_request_on_stream_one() {
        let offer = upgrade_offer(CURL_UPGRADE).unwrap();
        let frame = synthesize_headers_frame(&offer).unwrap();

        let len = u32::from_be_bytes([0, frame[0], frame[1], frame[2]]) as usize;
        assert_eq!(len, frame.len() - FRAME_HEADER_LEN);
        assert_eq!(frame[3], FRAME_TYPE_HEADERS);
        assert_eq!(frame[4], FLAG_END_STREAM | FLAG_END_HEADERS);
        assert_eq!(&frame[5..9], &[0, 0, 0, 1]);

        let decoded = hpack::Decoder::new().decode(&frame[9..]).unwrap();
        assert_eq!(
            decoded,
            vec![
                (b":method".to_vec(), b"GET".to_vec()),
                (b":path".to_vec(), b"/index.html".to_vec()),
                (b":scheme".to_vec(), b"http".to_vec()),
                (b":authority".to_vec(), b"127.0.0.1:8080".to_vec()),
            ]
        );
    }

    #[test]
    fn headers_frame_omits_missing_authority() {
        let offer = UpgradeOffer {
            method: "GET".to_string(),
            path: "/".to_string(),
            authority: None,
        };
        let frame = synthesize_headers_frame(&offer).unwrap();
        let decoded = hpack::Decoder::new().decode(&frame[9..]).unwrap();
        assert_eq!(decoded.len(), 3);
        assert!(decoded.iter().all(|(name, _)| name != b":authority"));
    }

    #[test]
    fn oversized_request_line_is_not_upgraded() {
        let offer = UpgradeOffer {
            method: "GET".to_string(),
            path: format!("/{}", "a".repeat(DEFAULT_MAX_FRAME_SIZE)),
            authority: None,
        };
        assert!(synthesize_headers_frame(&offer).is_none());
    }

    #[test]
    fn preface_end_covers_first_settings_frame() {
        let mut buf = PREFACE.to_vec();
        assert!(matches!(client_preface_end(&buf), Ok(None)));
        buf.extend_from_slice(&[0, 0, 6, FRAME_TYPE_SETTINGS, 0, 0, 0, 0, 0]);
        assert!(matches!(client_preface_end(&buf), Ok(None)));
        buf.extend_from_slice(&[0, 3, 0, 0, 0, 100]);
        assert!(matches!(client_preface_end(&buf), Ok(Some(39))));
        buf.extend_from_slice(b"next frame");
        assert!(matches!(client_preface_end(&buf), Ok(Some(39))));
    }

    #[test]
    fn preface_errors() {
        assert!(matches!(
            client_preface_end(b"GET / HTTP/1.1\r\n"),
            Err(UpgradeError::InvalidPreface)
        ));
        let mut buf = PREFACE.to_vec();
        buf.extend_from_slice(&[0, 0, 0, FRAME_TYPE_HEADERS, 0, 0, 0, 0, 1]);
        assert!(matches!(
            client_preface_end(&buf),
            Err(UpgradeError::SettingsExpected(FRAME_TYPE_HEADERS))
        ));
        let mut buf = PREFACE.to_vec();
        buf.extend_from_slice(&[0, 0x40, 1, FRAME_TYPE_SETTINGS, 0, 0, 0, 0, 0]);
        assert!(matches!(
            client_preface_end(&buf),
            Err(UpgradeError::FrameTooLarge(16_385))
        ));
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[monoio::test(timer_enabled = true)]
    async fn silent_peer_is_dropped() {
        let (_client, server) = connected_pair().await;
        let res = negotiate(server, 8192, Duration::from_millis(50)).await;
        assert!(matches!(res, Err(UpgradeError::Idle(_))));
    }

    #[monoio::test(timer_enabled = true)]
    async fn missing_preface_after_switching_protocols_times_out() {
        let (mut client, server) = connected_pair().await;
        let (res, _) = client.write_all(CURL_UPGRADE).await;
        res.unwrap();

        let res = negotiate(server, 8192, Duration::from_millis(50)).await;
        assert!(matches!(res, Err(UpgradeError::Idle(_))));

        let (res, buf) = client.read(Vec::with_capacity(256)).await;
        let n = res.unwrap();
        assert!(buf[..n].starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));
    }
}
