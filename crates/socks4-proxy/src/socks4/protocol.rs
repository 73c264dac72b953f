//! SOCKS4 protocol implementation

use super::{Command, ReplyCode, CLIENT_VERSION, HEADER_LEN, MIN_REQUEST_LEN, REPLY_LEN, REPLY_VERSION};
use crate::error::{MalformedRequest, Result};
use bytes::BytesMut;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// A decoded client request. Only well-formed requests are ever constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub version: u8,
    pub command: Command,
    pub port: u16,
    pub address: Ipv4Addr,
    /// Not validated; kept for logging
    pub user_id: Vec<u8>,
    /// SOCKS4a host name following the userid, if the address asked for one
    pub hostname: Option<String>,
}

impl ClientRequest {
    /// Decode a request from the bytes a client sent.
    ///
    /// The userid runs from the end of the fixed header to the first NUL. When
    /// no NUL is present the last byte is treated as the terminator. Address and
    /// port are not checked against any policy.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, MalformedRequest> {
        if buf.len() < MIN_REQUEST_LEN {
            return Err(MalformedRequest::TooShort(buf.len()));
        }

        let version = buf[0];
        if version != CLIENT_VERSION {
            return Err(MalformedRequest::BadVersion(version));
        }

        let command =
            Command::from_byte(buf[1]).ok_or(MalformedRequest::UnknownCommand(buf[1]))?;
        let port = u16::from_be_bytes([buf[2], buf[3]]);
        let address = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);

        let rest = &buf[HEADER_LEN..];
        let (user_id, trailer) = match find_nul(rest) {
            Some(end) => (&rest[..end], &rest[end + 1..]),
            None => (&rest[..rest.len() - 1], &[][..]),
        };

        let hostname = if is_socks4a_address(&address) {
            parse_hostname(trailer)
        } else {
            None
        };

        Ok(Self {
            version,
            command,
            port,
            address,
            user_id: user_id.to_vec(),
            hostname,
        })
    }

    /// Host name to dial when SOCKS4a is honoured
    pub fn socks4a_hostname(&self, socks4a: bool) -> Option<&str> {
        if socks4a {
            self.hostname.as_deref()
        } else {
            None
        }
    }

    pub fn user_id_lossy(&self) -> String {
        String::from_utf8_lossy(&self.user_id).into_owned()
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hostname {
            Some(host) => write!(f, "{} {}:{}", self.command.as_str(), host, self.port),
            None => write!(f, "{} {}:{}", self.command.as_str(), self.address, self.port),
        }
    }
}

/// 8-byte server reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub port: u16,
    pub address: Ipv4Addr,
}

impl Reply {
    pub fn new(code: ReplyCode, port: u16, address: Ipv4Addr) -> Self {
        Self {
            code,
            port,
            address,
        }
    }

    /// Grant echoing the destination the client asked for
    pub fn granted(request: &ClientRequest) -> Self {
        Self::new(ReplyCode::Granted, request.port, request.address)
    }

    /// Rejection with zeroed port and address
    pub fn rejected() -> Self {
        Self::new(ReplyCode::Rejected, 0, Ipv4Addr::UNSPECIFIED)
    }

    pub fn encode(&self) -> [u8; REPLY_LEN] {
        let mut out = [0u8; REPLY_LEN];
        out[0] = REPLY_VERSION;
        out[1] = self.code as u8;
        out[2..4].copy_from_slice(&self.port.to_be_bytes());
        out[4..8].copy_from_slice(&self.address.octets());
        out
    }
}

/// Length of the first complete request in `buf`, if there is one.
///
/// A buffer whose version or command byte is already wrong counts as complete
/// so the client is rejected without waiting for more input.
pub fn request_frame_len(buf: &[u8], socks4a: bool) -> Option<usize> {
    if buf.len() >= 2 && (buf[0] != CLIENT_VERSION || Command::from_byte(buf[1]).is_none()) {
        return Some(buf.len());
    }
    if buf.len() < MIN_REQUEST_LEN {
        return None;
    }

    let user_end = HEADER_LEN + find_nul(&buf[HEADER_LEN..])? + 1;

    let address = Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7]);
    if socks4a && is_socks4a_address(&address) {
        let host_end = user_end + find_nul(&buf[user_end..])? + 1;
        return Some(host_end);
    }
    Some(user_end)
}

/// Accumulate the client's request.
///
/// Reads until a complete frame is buffered, `max_len` bytes arrived, the
/// client closed its side, or `timeout` elapsed. Whatever arrived is returned
/// for the decoder to judge.
pub async fn read_request<S>(
    stream: &mut S,
    max_len: usize,
    socks4a: bool,
    timeout: Duration,
) -> Result<BytesMut>
where
    S: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(max_len);

    let fill = async {
        while buf.len() < max_len && request_frame_len(&buf, socks4a).is_none() {
            let remaining = (max_len - buf.len()) as u64;
            let n = (&mut *stream).take(remaining).read_buf(&mut buf).await?;
            if n == 0 {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let outcome = tokio::time::timeout(timeout, fill).await;
    match outcome {
        Ok(result) => result?,
        Err(_) => debug!("Request incomplete after {:?} ({} bytes)", timeout, buf.len()),
    }

    Ok(buf)
}

/// Send a reply and flush it
pub async fn send_reply<W>(stream: &mut W, reply: Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    stream.write_all(&reply.encode()).await?;
    stream.flush().await?;
    Ok(())
}

fn find_nul(buf: &[u8]) -> Option<usize> {
    buf.iter().position(|&b| b == 0)
}

/// 0.0.0.x with x != 0 marks a SOCKS4a request
fn is_socks4a_address(address: &Ipv4Addr) -> bool {
    let octets = address.octets();
    octets[..3] == [0, 0, 0] && octets[3] != 0
}

fn parse_hostname(trailer: &[u8]) -> Option<String> {
    let end = find_nul(trailer)?;
    if end == 0 {
        return None;
    }
    String::from_utf8(trailer[..end].to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::io::AsyncWriteExt;

    const CONNECT_LOCAL_8080: [u8; 9] = [0x04, 0x01, 0x1F, 0x90, 0x7F, 0x00, 0x00, 0x01, 0x00];

    #[test]
    fn test_command_from_byte() {
        assert_eq!(Command::from_byte(0x01), Some(Command::Connect));
        assert_eq!(Command::from_byte(0x02), Some(Command::Bind));
        assert_eq!(Command::from_byte(0x03), None);
        assert_eq!(Command::from_byte(0x00), None);
    }

    #[test]
    fn test_decode_connect() {
        let request = ClientRequest::decode(&CONNECT_LOCAL_8080).unwrap();
        assert_eq!(request.version, 4);
        assert_eq!(request.command, Command::Connect);
        assert_eq!(request.port, 8080);
        assert_eq!(request.address, Ipv4Addr::new(127, 0, 0, 1));
        assert!(request.user_id.is_empty());
        assert_eq!(request.hostname, None);
    }

    #[test]
    fn test_decode_user_id() {
        let mut buf = CONNECT_LOCAL_8080[..8].to_vec();
        buf.extend_from_slice(b"alice\0");
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.user_id, b"alice");
        assert_eq!(request.user_id_lossy(), "alice");
    }

    #[test]
    fn test_decode_without_terminator_drops_last_byte() {
        let mut buf = CONNECT_LOCAL_8080[..8].to_vec();
        buf.extend_from_slice(b"bob!");
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.user_id, b"bob");
    }

    #[test]
    fn test_decode_accepts_any_destination() {
        let buf = [0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.port, 0);
        assert_eq!(request.address, Ipv4Addr::UNSPECIFIED);
    }

    #[test]
    fn test_decode_rejects_bad_version() {
        let mut buf = CONNECT_LOCAL_8080;
        buf[0] = 0x03;
        assert_eq!(
            ClientRequest::decode(&buf),
            Err(MalformedRequest::BadVersion(3))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_command() {
        let mut buf = CONNECT_LOCAL_8080;
        buf[1] = 0x03;
        assert_eq!(
            ClientRequest::decode(&buf),
            Err(MalformedRequest::UnknownCommand(3))
        );
    }

    #[test]
    fn test_decode_socks4a_hostname() {
        let mut buf = vec![0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01];
        buf.extend_from_slice(b"carol\0example.org\0");
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.user_id, b"carol");
        assert_eq!(request.hostname.as_deref(), Some("example.org"));
        assert_eq!(request.socks4a_hostname(true), Some("example.org"));
        assert_eq!(request.socks4a_hostname(false), None);
        assert_eq!(request.to_string(), "connect example.org:80");
    }

    #[test]
    fn test_decode_socks4a_address_without_hostname() {
        let buf = [0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00];
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.hostname, None);
    }

    #[test]
    fn test_hostname_ignored_for_plain_address() {
        let mut buf = CONNECT_LOCAL_8080.to_vec();
        buf.extend_from_slice(b"example.org\0");
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.hostname, None);
    }

    #[test]
    fn test_reply_encoding() {
        let request = ClientRequest::decode(&CONNECT_LOCAL_8080).unwrap();
        assert_eq!(
            Reply::granted(&request).encode(),
            [0x00, 0x5A, 0x1F, 0x90, 0x7F, 0x00, 0x00, 0x01]
        );
        assert_eq!(
            Reply::rejected().encode(),
            [0x00, 0x5B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_frame_len() {
        assert_eq!(request_frame_len(&[], false), None);
        assert_eq!(request_frame_len(&CONNECT_LOCAL_8080[..5], false), None);
        assert_eq!(request_frame_len(&CONNECT_LOCAL_8080, false), Some(9));

        let mut with_user = CONNECT_LOCAL_8080[..8].to_vec();
        with_user.extend_from_slice(b"dave");
        assert_eq!(request_frame_len(&with_user, false), None);
        with_user.push(0);
        assert_eq!(request_frame_len(&with_user, false), Some(13));
    }

    #[test]
    fn test_frame_len_excludes_trailing_data() {
        let mut buf = CONNECT_LOCAL_8080.to_vec();
        buf.extend_from_slice(b"HELLO");
        assert_eq!(request_frame_len(&buf, false), Some(9));
        assert_eq!(ClientRequest::decode(&buf).unwrap().user_id, b"");
    }

    #[test]
    fn test_frame_len_malformed_is_complete() {
        assert_eq!(request_frame_len(&[0x05, 0x01, 0x00], false), Some(3));
        assert_eq!(request_frame_len(&[0x04, 0x07], false), Some(2));
    }

    #[test]
    fn test_frame_len_socks4a() {
        let mut buf = vec![0x04, 0x01, 0x00, 0x50, 0x00, 0x00, 0x00, 0x01, 0x00];
        assert_eq!(request_frame_len(&buf, false), Some(9));
        assert_eq!(request_frame_len(&buf, true), None);
        buf.extend_from_slice(b"localhost\0");
        assert_eq!(request_frame_len(&buf, true), Some(19));
    }

    #[tokio::test]
    async fn test_read_request_across_segments() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&[0x04, 0x01, 0x1F])
            .read(&[0x90, 0x7F, 0x00])
            .read(&[0x00, 0x01, b'e', b'v', b'e', 0x00])
            .build();

        let buf = read_request(&mut stream, 4096, false, Duration::from_secs(1))
            .await
            .unwrap();
        let request = ClientRequest::decode(&buf).unwrap();
        assert_eq!(request.port, 8080);
        assert_eq!(request.user_id, b"eve");
    }

    #[tokio::test]
    async fn test_read_request_stops_at_eof() {
        let mut stream = tokio_test::io::Builder::new()
            .read(&CONNECT_LOCAL_8080[..4])
            .build();

        let buf = read_request(&mut stream, 4096, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(buf.len(), 4);
        assert_eq!(
            ClientRequest::decode(&buf),
            Err(MalformedRequest::TooShort(4))
        );
    }

    #[tokio::test]
    async fn test_read_request_caps_length() {
        let mut payload = CONNECT_LOCAL_8080[..8].to_vec();
        payload.extend_from_slice(&[b'x'; 32]);
        let mut stream = tokio_test::io::Builder::new().read(&payload[..16]).build();

        let buf = read_request(&mut stream, 16, false, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(buf.len(), 16);
    }

    #[tokio::test]
    async fn test_read_request_times_out() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&CONNECT_LOCAL_8080[..6]).await.unwrap();

        let buf = read_request(&mut server, 4096, false, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(&buf[..], &CONNECT_LOCAL_8080[..6]);
        drop(client);
    }

    #[tokio::test]
    async fn test_send_reply() {
        let mut stream = tokio_test::io::Builder::new()
            .write(&[0x00, 0x5B, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
            .build();
        send_reply(&mut stream, Reply::rejected()).await.unwrap();
    }

    proptest! {
        #[test]
        fn prop_short_buffers_are_invalid(buf in proptest::collection::vec(any::<u8>(), 0..MIN_REQUEST_LEN)) {
            prop_assert_eq!(ClientRequest::decode(&buf), Err(MalformedRequest::TooShort(buf.len())));
        }

        #[test]
        fn prop_wrong_version_is_invalid(
            version in any::<u8>().prop_filter("client version", |v| *v != CLIENT_VERSION),
            tail in proptest::collection::vec(any::<u8>(), 8..64),
        ) {
            let mut buf = vec![version];
            buf.extend_from_slice(&tail);
            prop_assert_eq!(ClientRequest::decode(&buf), Err(MalformedRequest::BadVersion(version)));
        }

        #[test]
        fn prop_unknown_command_is_invalid(
            command in any::<u8>().prop_filter("known command", |c| *c != 1 && *c != 2),
            tail in proptest::collection::vec(any::<u8>(), 7..64),
        ) {
            let mut buf = vec![CLIENT_VERSION, command];
            buf.extend_from_slice(&tail);
            prop_assert_eq!(ClientRequest::decode(&buf), Err(MalformedRequest::UnknownCommand(command)));
        }

        #[test]
        fn prop_granted_reply_fields(port in any::<u16>(), address in any::<u32>()) {
            let reply = Reply::new(ReplyCode::Granted, port, Ipv4Addr::from(address));
            let bytes = reply.encode();
            prop_assert_eq!(bytes[0], 0);
            prop_assert_eq!(bytes[1], 90);
            prop_assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), port);
            prop_assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), address);
        }
    }
}
