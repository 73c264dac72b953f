//! SOCKS4/4a proxy implementation

mod handler;
mod protocol;

pub use handler::Socks4Server;
pub use protocol::{read_request, request_frame_len, ClientRequest, Reply};

/// Version byte every client request must carry
pub const CLIENT_VERSION: u8 = 0x04;

/// Version byte of every server reply
pub const REPLY_VERSION: u8 = 0x00;

/// Fixed request header: version, command, port, address
pub const HEADER_LEN: usize = 8;

/// Header plus the userid terminator
pub const MIN_REQUEST_LEN: usize = HEADER_LEN + 1;

/// Reply is always exactly this long
pub const REPLY_LEN: usize = 8;

/// SOCKS4 command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Connect = 0x01,
    Bind = 0x02,
}

impl Command {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Connect),
            0x02 => Some(Self::Bind),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::Bind => "bind",
        }
    }
}

/// SOCKS4 reply code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Granted = 90,
    Rejected = 91,
}

impl ReplyCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Rejected => "rejected",
        }
    }
}
