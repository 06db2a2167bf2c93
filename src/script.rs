// This module contains the script interpreter.
//
// A test script is a plain-text file with one command per line. Lines are
// tokenized on whitespace; the first token names the command and the rest
// are positional arguments. The interpreter executes commands strictly in
// order against a single mutable session: the destination host and port,
// the receive timeout, and the most recently built packet. Packet-building
// commands overwrite the current packet; `show` and `send` read it.
//
// Per-line failures (unknown commands, malformed arguments, receive
// timeouts) are logged with the 1-based line number and execution continues
// at the next line. Only socket-level I/O failures abort the run.

use crate::dump;
use crate::tftp::{self, Packet, ProbeSocket, SocketError};
use anyhow::Context;
use std::error;
use std::fmt;
use std::io::BufRead;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

const COMMENT_CHAR: char = '#';
const DEFAULT_TIMEOUT_SECS: f64 = 5.0;

///////////////////////////////////////////////////////////////
// Error-handling objects

/// Represents an error in a single script line. These never abort the run.
#[derive(Debug, PartialEq)]
pub enum ScriptError {
    UnknownCommand(String),
    MissingArgument(&'static str, &'static str),
    BadArgument(&'static str, String),
    NotAscii(String),
    NoPacket,
    NoDestination,
    Unresolvable(String),
}

impl error::Error for ScriptError {}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::UnknownCommand(cmd) => write!(f, "unrecognised command \"{}\"", cmd),
            Self::MissingArgument(cmd, what) => write!(f, "{}: missing {}", cmd, what),
            Self::BadArgument(what, value) => write!(f, "invalid {} \"{}\"", what, value),
            Self::NotAscii(token) => write!(f, "non-ASCII token \"{}\"", token),
            Self::NoPacket => write!(f, "no packet has been built yet"),
            Self::NoDestination => write!(f, "no destination set, use \"ip\" first"),
            Self::Unresolvable(dst) => write!(f, "cannot resolve destination \"{}\"", dst),
        }
    }
}

/// The outcome of executing one command.
#[derive(Debug)]
pub enum CommandError {
    /// Bad script input; logged, execution continues.
    Script(ScriptError),

    /// Nothing arrived within the configured wait; logged, execution
    /// continues with the destination state unchanged.
    Timeout(f64),

    /// A socket-level failure. Aborts the run.
    Fatal(SocketError),
}

impl From<ScriptError> for CommandError {
    fn from(e: ScriptError) -> Self {
        CommandError::Script(e)
    }
}

/// Whether the interpreter should keep reading lines.
#[derive(Debug, PartialEq)]
pub enum Flow {
    Continue,
    Exit,
}

///////////////////////////////////////////////////////////////
// Command parsing

/// One fully parsed script line. Argument validation happens here, before
/// any session state is touched, so a malformed line can never leave a
/// half-built packet behind.
#[derive(Debug, PartialEq)]
pub enum Command {
    Exit,
    Ip(String),
    Port(u16),
    Timeout(f64),
    Build(Packet),
    Show,
    Send,
    Sleep(f64),
    Receive,
}

fn require<'a>(
    args: &'a [&str],
    index: usize,
    cmd: &'static str,
    what: &'static str,
) -> Result<&'a str, ScriptError> {
    args.get(index)
        .copied()
        .ok_or(ScriptError::MissingArgument(cmd, what))
}

/// Parses a 16-bit wire integer. Out-of-range values truncate to the low
/// 16 bits, mirroring the high/low byte split of the encoding.
fn parse_wire_u16(what: &'static str, token: &str) -> Result<u16, ScriptError> {
    let value: i64 = token
        .parse()
        .map_err(|_| ScriptError::BadArgument(what, token.to_string()))?;
    Ok((value & 0xFFFF) as u16)
}

fn parse_seconds(what: &'static str, token: &str) -> Result<f64, ScriptError> {
    let secs: f64 = token
        .parse()
        .map_err(|_| ScriptError::BadArgument(what, token.to_string()))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ScriptError::BadArgument(what, token.to_string()));
    }
    Ok(secs)
}

/// Packet fields travel as raw bytes, so tokens must be ASCII for the
/// character-to-byte mapping to be well defined.
fn ascii_tokens(tokens: &[&str]) -> Result<Vec<String>, ScriptError> {
    for token in tokens {
        if !token.is_ascii() {
            return Err(ScriptError::NotAscii(token.to_string()));
        }
    }
    Ok(tokens.iter().map(|t| t.to_string()).collect())
}

/// Joins content words with single spaces; the DSL has no quoting, so
/// multi-word payloads arrive as separate tokens.
fn joined_words(tokens: &[&str]) -> Result<String, ScriptError> {
    Ok(ascii_tokens(tokens)?.join(" "))
}

fn raw_tokens(tokens: &[&str]) -> Result<Vec<String>, ScriptError> {
    for token in tokens {
        if !token.is_ascii() {
            return Err(ScriptError::NotAscii(token.to_string()));
        }
        if token.len() == 2 && u8::from_str_radix(token, 16).is_err() {
            return Err(ScriptError::BadArgument("hex byte", token.to_string()));
        }
    }
    Ok(tokens.iter().map(|t| t.to_string()).collect())
}

impl Command {
    /// Classifies one raw script line. Returns `None` for blank and comment
    /// lines, which are skipped without touching any state.
    pub fn parse(line: &str) -> Option<Result<Command, ScriptError>> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(COMMENT_CHAR) {
            return None;
        }

        let mut tokens = trimmed.split_whitespace();
        let cmd = tokens.next()?;
        let args: Vec<&str> = tokens.collect();
        Some(Self::parse_command(cmd, &args))
    }

    fn parse_command(cmd: &str, args: &[&str]) -> Result<Command, ScriptError> {
        match cmd {
            "exit" => Ok(Command::Exit),
            "ip" => Ok(Command::Ip(require(args, 0, "ip", "host")?.to_string())),
            "port" => {
                let token = require(args, 0, "port", "port number")?;
                let port = token
                    .parse()
                    .map_err(|_| ScriptError::BadArgument("port number", token.to_string()))?;
                Ok(Command::Port(port))
            }
            "timeout" => {
                let token = require(args, 0, "timeout", "seconds")?;
                Ok(Command::Timeout(parse_seconds("timeout", token)?))
            }
            "rrq" => Ok(Command::Build(Packet::ReadReq {
                fields: ascii_tokens(args)?,
            })),
            "wrq" => Ok(Command::Build(Packet::WriteReq {
                fields: ascii_tokens(args)?,
            })),
            "data" => {
                let block = parse_wire_u16("block number", require(args, 0, "data", "block number")?)?;
                let size_token = require(args, 1, "data", "block size")?;
                let size = size_token
                    .parse()
                    .map_err(|_| ScriptError::BadArgument("block size", size_token.to_string()))?;
                // Content repeats cyclically to fill the block, so it always
                // carries at least the trailing newline.
                let content = joined_words(&args[2..])? + "\n";
                Ok(Command::Build(Packet::Data {
                    block,
                    size,
                    content,
                }))
            }
            "ack" => {
                let block = parse_wire_u16("block number", require(args, 0, "ack", "block number")?)?;
                Ok(Command::Build(Packet::Ack { block }))
            }
            "error" => {
                let code = parse_wire_u16("error code", require(args, 0, "error", "error code")?)?;
                let message = joined_words(&args[1..])?;
                Ok(Command::Build(Packet::Error { code, message }))
            }
            "raw" => Ok(Command::Build(Packet::Raw {
                tokens: raw_tokens(args)?,
            })),
            "show" => Ok(Command::Show),
            "send" => Ok(Command::Send),
            "sleep" => {
                let token = require(args, 0, "sleep", "seconds")?;
                Ok(Command::Sleep(parse_seconds("sleep", token)?))
            }
            "receive" => Ok(Command::Receive),
            _ => Err(ScriptError::UnknownCommand(cmd.to_string())),
        }
    }
}

///////////////////////////////////////////////////////////////
// Session execution

/// Executes commands against the session state. One interpreter owns one
/// socket for the whole run.
pub struct Interpreter {
    sock: ProbeSocket,
    host: Option<String>,
    port: u16,
    timeout_secs: f64,
    packet: Option<Vec<u8>>,
}

impl Interpreter {
    pub fn new(sock: ProbeSocket) -> Interpreter {
        Interpreter {
            sock,
            host: None,
            port: tftp::DEFAULT_PORT,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            packet: None,
        }
    }

    /// Reads the script line by line and executes it to completion. Script
    /// errors and receive timeouts are logged and skipped; only read
    /// failures on the script itself and socket I/O errors are fatal.
    pub async fn run<R: BufRead>(&mut self, script: R) -> anyhow::Result<()> {
        for (index, line) in script.lines().enumerate() {
            let line = line.context("failed to read script line")?;
            let linenum = index + 1;

            let command = match Command::parse(&line) {
                None => continue,
                Some(Ok(command)) => command,
                Some(Err(e)) => {
                    log::error!("{} at line {}", e, linenum);
                    continue;
                }
            };

            match self.execute(command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Exit) => break,
                Err(CommandError::Script(e)) => log::error!("{} at line {}", e, linenum),
                Err(CommandError::Timeout(secs)) => {
                    log::warn!("timeout on receive packet - waited {} seconds", secs)
                }
                Err(CommandError::Fatal(e)) => {
                    return Err(e).with_context(|| format!("network failure at line {}", linenum))
                }
            }
        }

        Ok(())
    }

    /// Executes a single command, mutating the session state it names.
    pub async fn execute(&mut self, command: Command) -> Result<Flow, CommandError> {
        match command {
            Command::Exit => return Ok(Flow::Exit),
            Command::Ip(host) => self.host = Some(host),
            Command::Port(port) => self.port = port,
            Command::Timeout(secs) => self.timeout_secs = secs,
            Command::Build(packet) => {
                // A fresh request goes to the well-known port; the reply's
                // source port takes over once the exchange starts.
                if matches!(packet, Packet::ReadReq { .. } | Packet::WriteReq { .. }) {
                    self.port = tftp::DEFAULT_PORT;
                }
                self.packet = Some(packet.encode());
            }
            Command::Show => {
                for line in dump::render(self.current_packet()?, '-') {
                    println!("{}", line);
                }
            }
            Command::Send => {
                let dst = self.destination()?;
                let bytes = self.current_packet()?;
                for line in dump::render(bytes, '>') {
                    println!("{}", line);
                }
                self.sock.send(bytes, dst).await.map_err(CommandError::Fatal)?;
            }
            Command::Sleep(secs) => tokio::time::sleep(Duration::from_secs_f64(secs)).await,
            Command::Receive => {
                let ttl = Duration::from_secs_f64(self.timeout_secs);
                match self.sock.recv_with_timeout(ttl).await {
                    Ok((bytes, src)) => {
                        for line in dump::render(&bytes, '<') {
                            println!("{}", line);
                        }
                        // Continue the exchange on the server's reply port.
                        self.port = src.port();
                    }
                    Err(SocketError::Timeout(_)) => {
                        return Err(CommandError::Timeout(self.timeout_secs))
                    }
                    Err(e) => return Err(CommandError::Fatal(e)),
                }
            }
        }

        Ok(Flow::Continue)
    }

    fn current_packet(&self) -> Result<&[u8], ScriptError> {
        self.packet.as_deref().ok_or(ScriptError::NoPacket)
    }

    fn destination(&self) -> Result<SocketAddr, ScriptError> {
        let host = self.host.as_ref().ok_or(ScriptError::NoDestination)?;
        (host.as_str(), self.port)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ScriptError::Unresolvable(format!("{}:{}", host, self.port)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn interpreter() -> Interpreter {
        Interpreter::new(ProbeSocket::bind(([127, 0, 0, 1], 0).into()).unwrap())
    }

    fn loopback_peer() -> (ProbeSocket, u16) {
        let sock = ProbeSocket::bind(([127, 0, 0, 1], 0).into()).unwrap();
        let port = sock.local_addr().unwrap().port();
        (sock, port)
    }

    #[test]
    fn test_parse_skips_blank_and_comment_lines() {
        assert_eq!(Command::parse(""), None);
        assert_eq!(Command::parse("   \t  "), None);
        assert_eq!(Command::parse("# a comment"), None);
        assert_eq!(Command::parse("   # indented comment"), None);
    }

    #[test]
    fn test_parse_simple_commands() {
        assert_eq!(Command::parse("exit"), Some(Ok(Command::Exit)));
        assert_eq!(
            Command::parse("ip 10.0.0.1"),
            Some(Ok(Command::Ip("10.0.0.1".to_string())))
        );
        assert_eq!(Command::parse("port 6969"), Some(Ok(Command::Port(6969))));
        assert_eq!(
            Command::parse("timeout 1.5"),
            Some(Ok(Command::Timeout(1.5)))
        );
        assert_eq!(Command::parse("show"), Some(Ok(Command::Show)));
        assert_eq!(Command::parse("receive"), Some(Ok(Command::Receive)));
    }

    #[test]
    fn test_parse_rrq() {
        assert_eq!(
            Command::parse("rrq test.txt octet"),
            Some(Ok(Command::Build(Packet::ReadReq {
                fields: vec!["test.txt".to_string(), "octet".to_string()],
            })))
        );
    }

    #[test]
    fn test_parse_data_joins_words() {
        assert_eq!(
            Command::parse("data 1 512 hello tftp world"),
            Some(Ok(Command::Build(Packet::Data {
                block: 1,
                size: 512,
                content: "hello tftp world\n".to_string(),
            })))
        );
    }

    #[test]
    fn test_parse_data_without_words() {
        assert_eq!(
            Command::parse("data 1 4"),
            Some(Ok(Command::Build(Packet::Data {
                block: 1,
                size: 4,
                content: "\n".to_string(),
            })))
        );
    }

    #[test]
    fn test_parse_error_packet() {
        assert_eq!(
            Command::parse("error 2 access denied"),
            Some(Ok(Command::Build(Packet::Error {
                code: 2,
                message: "access denied".to_string(),
            })))
        );
    }

    #[test]
    fn test_parse_block_number_truncates() {
        assert_eq!(
            Command::parse("ack 65536"),
            Some(Ok(Command::Build(Packet::Ack { block: 0 })))
        );
        assert_eq!(
            Command::parse("ack -1"),
            Some(Ok(Command::Build(Packet::Ack { block: 0xFFFF })))
        );
    }

    #[test]
    fn test_parse_raw() {
        assert_eq!(
            Command::parse("raw 00 63 A xyz"),
            Some(Ok(Command::Build(Packet::Raw {
                tokens: vec![
                    "00".to_string(),
                    "63".to_string(),
                    "A".to_string(),
                    "xyz".to_string(),
                ],
            })))
        );
    }

    #[test]
    fn test_parse_failures() {
        assert_eq!(
            Command::parse("foo bar"),
            Some(Err(ScriptError::UnknownCommand("foo".to_string())))
        );
        assert_eq!(
            Command::parse("ack"),
            Some(Err(ScriptError::MissingArgument("ack", "block number")))
        );
        assert_eq!(
            Command::parse("ack seven"),
            Some(Err(ScriptError::BadArgument(
                "block number",
                "seven".to_string()
            )))
        );
        assert_eq!(
            Command::parse("data 1 many"),
            Some(Err(ScriptError::BadArgument(
                "block size",
                "many".to_string()
            )))
        );
        assert_eq!(
            Command::parse("timeout -3"),
            Some(Err(ScriptError::BadArgument("timeout", "-3".to_string())))
        );
        assert_eq!(
            Command::parse("port 70000"),
            Some(Err(ScriptError::BadArgument(
                "port number",
                "70000".to_string()
            )))
        );
        assert_eq!(
            Command::parse("raw zz"),
            Some(Err(ScriptError::BadArgument("hex byte", "zz".to_string())))
        );
        assert_eq!(
            Command::parse("rrq f\u{00FC}nf octet"),
            Some(Err(ScriptError::NotAscii("f\u{00FC}nf".to_string())))
        );
    }

    #[test]
    fn test_unknown_command_diagnostic_names_the_command() {
        let e = ScriptError::UnknownCommand("foo".to_string());
        assert_eq!(format!("{} at line 5", e), "unrecognised command \"foo\" at line 5");
    }

    #[tokio::test]
    async fn test_execute_build_sets_current_packet() {
        let mut interp = interpreter();

        let flow = interp
            .execute(Command::Build(Packet::Ack { block: 7 }))
            .await
            .unwrap();
        assert_eq!(flow, Flow::Continue);
        assert_eq!(interp.packet, Some(vec![0x00, 0x04, 0x00, 0x07]));
    }

    #[tokio::test]
    async fn test_execute_request_resets_port() {
        let mut interp = interpreter();
        interp.execute(Command::Port(12345)).await.unwrap();
        assert_eq!(interp.port, 12345);

        interp
            .execute(Command::Build(Packet::ReadReq {
                fields: vec!["a".to_string(), "octet".to_string()],
            }))
            .await
            .unwrap();
        assert_eq!(interp.port, tftp::DEFAULT_PORT);
    }

    #[tokio::test]
    async fn test_execute_ack_keeps_port() {
        let mut interp = interpreter();
        interp.execute(Command::Port(12345)).await.unwrap();
        interp
            .execute(Command::Build(Packet::Ack { block: 1 }))
            .await
            .unwrap();
        assert_eq!(interp.port, 12345);
    }

    #[tokio::test]
    async fn test_execute_show_without_packet_fails() {
        let mut interp = interpreter();

        let result = interp.execute(Command::Show).await;
        assert!(matches!(
            result,
            Err(CommandError::Script(ScriptError::NoPacket))
        ));
    }

    #[tokio::test]
    async fn test_execute_send_without_destination_fails() {
        let mut interp = interpreter();
        interp
            .execute(Command::Build(Packet::Ack { block: 1 }))
            .await
            .unwrap();

        let result = interp.execute(Command::Send).await;
        assert!(matches!(
            result,
            Err(CommandError::Script(ScriptError::NoDestination))
        ));
        // The failed send leaves the current packet in place.
        assert_eq!(interp.packet, Some(vec![0x00, 0x04, 0x00, 0x01]));
    }

    #[tokio::test]
    async fn test_execute_exit() {
        let mut interp = interpreter();
        assert_eq!(interp.execute(Command::Exit).await.unwrap(), Flow::Exit);
    }

    #[tokio::test]
    async fn test_execute_receive_times_out() {
        let mut interp = interpreter();
        interp.execute(Command::Timeout(0.05)).await.unwrap();

        let result = interp.execute(Command::Receive).await;
        match result {
            Err(CommandError::Timeout(secs)) => assert_eq!(secs, 0.05),
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_then_receive_adopts_reply_port() {
        let (peer, peer_port) = loopback_peer();
        let mut interp = interpreter();

        interp
            .execute(Command::Ip("127.0.0.1".to_string()))
            .await
            .unwrap();
        interp.execute(Command::Port(peer_port)).await.unwrap();
        interp
            .execute(Command::Build(Packet::Ack { block: 0 }))
            .await
            .unwrap();
        interp.execute(Command::Send).await.unwrap();

        let (bytes, probe_addr) = peer
            .recv_with_timeout(Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(bytes, vec![0x00, 0x04, 0x00, 0x00]);

        // Reply from a different socket, the way a server answers from an
        // ephemeral transfer port.
        let (reply_sock, reply_port) = loopback_peer();
        reply_sock
            .send(&Packet::Ack { block: 1 }.encode(), probe_addr)
            .await
            .unwrap();

        interp.execute(Command::Receive).await.unwrap();
        assert_eq!(interp.port, reply_port);
    }

    #[tokio::test]
    async fn test_run_script_to_exit() {
        let mut interp = interpreter();
        let script = "\
# exercise a read request
rrq test.txt octet
show
nonsense here
ack 7
show
exit
ack 9
";

        interp.run(Cursor::new(script)).await.unwrap();

        // The line after `exit` never executed.
        assert_eq!(interp.packet, Some(vec![0x00, 0x04, 0x00, 0x07]));
    }

    #[tokio::test]
    async fn test_run_bad_line_preserves_packet() {
        let mut interp = interpreter();
        let script = "ack 7\nack seven\ndata nope 4\n";

        interp.run(Cursor::new(script)).await.unwrap();
        assert_eq!(interp.packet, Some(vec![0x00, 0x04, 0x00, 0x07]));
    }

    #[tokio::test]
    async fn test_run_script_from_file() {
        use std::fs::File;
        use std::io::{BufReader, Write};
        use tempdir::TempDir;

        let tmpdir = TempDir::new("scratch").unwrap();
        let path = tmpdir.path().join("probe.txt");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "wrq out.bin octet").unwrap();
        writeln!(file, "data 1 8 xy").unwrap();
        writeln!(file, "exit").unwrap();

        let mut interp = interpreter();
        interp
            .run(BufReader::new(File::open(&path).unwrap()))
            .await
            .unwrap();

        assert_eq!(
            interp.packet,
            Some(vec![0x00, 0x03, 0x00, 0x01, 0x78, 0x79, 0x0A, 0x78, 0x79, 0x0A, 0x78, 0x79])
        );
    }
}
