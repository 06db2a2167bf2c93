use async_io::Async;
use std::error;
use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;
use tokio::time::error::Elapsed;
use tokio::time::timeout;

/// Requests are sent to this port unless the script overrides it.
pub const DEFAULT_PORT: u16 = 69;

/// Upper bound on a single inbound datagram.
pub const MAX_PACKET_SIZE: usize = 65536;

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error returned from the probe socket.
#[derive(Debug)]
pub enum SocketError {
    IO(io::Error),
    Timeout(Elapsed),
}

impl error::Error for SocketError {}

impl fmt::Display for SocketError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SocketError::IO(e) => write!(f, "Socket IO error: {:#?}", e),
            SocketError::Timeout(e) => write!(f, "Socket IO timeout: {:#?}", e),
        }
    }
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        SocketError::IO(e)
    }
}

impl From<Elapsed> for SocketError {
    fn from(e: Elapsed) -> Self {
        SocketError::Timeout(e)
    }
}

type TftpResult<T> = Result<T, SocketError>;

/// A TFTP message as described by one script command. Encoding never fails:
/// anything the wire format cannot express is rejected when the command is
/// parsed, before a `Packet` is ever built.
#[derive(Debug, PartialEq)]
pub enum Packet {
    /// A read request packet: filename, mode and any further options.
    ReadReq {
        /// NUL-terminated string fields, in order.
        fields: Vec<String>,
    },

    /// A write request packet, same layout as a read request.
    WriteReq { fields: Vec<String> },

    /// A data packet whose payload is the content string repeated until
    /// exactly `size` bytes are filled.
    Data {
        block: u16,
        size: usize,
        content: String,
    },

    /// An acknowledgment packet.
    Ack { block: u16 },

    /// An error packet.
    Error { code: u16, message: String },

    /// An arbitrary byte sequence assembled token by token, for probing a
    /// server with deliberately malformed input.
    Raw { tokens: Vec<String> },
}

fn push_u16(buf: &mut Vec<u8>, value: u16) {
    buf.push(((value & 0xFF00) >> 8) as u8);
    buf.push((value & 0x00FF) as u8);
}

fn encode_request(opcode: u16, fields: &[String]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + fields.iter().map(|f| f.len() + 1).sum::<usize>());
    push_u16(&mut buf, opcode);
    for field in fields {
        buf.extend_from_slice(field.as_bytes());
        buf.push(0);
    }
    buf
}

/// Decodes one `raw` token into a byte: a single character contributes its
/// ASCII code, two characters are read as a hex byte, any other length
/// contributes a zero byte.
fn raw_token_byte(token: &str) -> u8 {
    match token.len() {
        1 => token.as_bytes()[0],
        2 => u8::from_str_radix(token, 16).unwrap_or(0),
        _ => 0,
    }
}

impl Packet {
    /// Produces the exact wire bytes for this packet.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Packet::ReadReq { fields } => encode_request(OP_RRQ, fields),
            Packet::WriteReq { fields } => encode_request(OP_WRQ, fields),
            Packet::Data {
                block,
                size,
                content,
            } => {
                let mut buf = Vec::with_capacity(4 + size);
                push_u16(&mut buf, OP_DATA);
                push_u16(&mut buf, *block);
                // The script layer always appends a trailing newline, so the
                // repeating content is never empty.
                debug_assert!(!content.is_empty());
                let bytes = content.as_bytes();
                for i in 0..*size {
                    buf.push(bytes[i % bytes.len()]);
                }
                buf
            }
            Packet::Ack { block } => {
                let mut buf = Vec::with_capacity(4);
                push_u16(&mut buf, OP_ACK);
                push_u16(&mut buf, *block);
                buf
            }
            Packet::Error { code, message } => {
                let mut buf = Vec::with_capacity(5 + message.len());
                push_u16(&mut buf, OP_ERROR);
                push_u16(&mut buf, *code);
                buf.extend_from_slice(message.as_bytes());
                buf.push(0);
                buf
            }
            Packet::Raw { tokens } => tokens.iter().map(|t| raw_token_byte(t)).collect(),
        }
    }
}

///////////////////////////////////////////////////////////////
/// Wrapper around a UDP socket that sends raw packet bytes and
/// receives whole datagrams with a bounded wait.
pub struct ProbeSocket {
    sock: Async<UdpSocket>,
}

impl ProbeSocket {
    pub fn bind(addr: SocketAddr) -> TftpResult<ProbeSocket> {
        Ok(ProbeSocket {
            sock: Async::<UdpSocket>::bind(addr)?,
        })
    }

    /// Transmits `bytes` as a single datagram to `dst`.
    pub async fn send(&self, bytes: &[u8], dst: SocketAddr) -> TftpResult<()> {
        self.sock.send_to(bytes, dst).await?;
        Ok(())
    }

    /// Waits up to `ttl` for one inbound datagram, returning its bytes and
    /// the sender's address.
    pub async fn recv_with_timeout(&self, ttl: Duration) -> TftpResult<(Vec<u8>, SocketAddr)> {
        let mut buf = vec![0; MAX_PACKET_SIZE];
        let (total_written, src) = timeout(ttl, self.sock.recv_from(&mut buf)).await??;

        buf.truncate(total_written);
        Ok((buf, src))
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.sock.get_ref().local_addr()
    }
}
