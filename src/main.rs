// A scriptable TFTP packet exerciser.
//
// Reads a line-oriented test script describing TFTP messages, encodes each
// one into its exact wire bytes, sends them over UDP to a configurable
// target, and renders every packet shown, sent or received as an annotated
// hex dump. Packets are built byte by byte from the script with no protocol
// state machine behind them, so malformed and out-of-order packets can be
// sent on purpose. Probing a server never needs new code, just a new
// script.
//
// Example script:
//
//   ip 192.168.1.20
//   rrq test.txt octet
//   send
//   receive
//   ack 1
//   send
//
// The well-known request port 69 is used by default; after a `receive`, the
// session switches to the server's reply port, matching how a real transfer
// continues on the server's ephemeral port.

use anyhow::{Context, Result};
use clap::Parser;
use env_logger::Env;
use std::fs::File;
use std::io::BufReader;
use std::net::Ipv4Addr;
use std::path::PathBuf;

mod dump;
mod script;
mod tftp;

use script::Interpreter;
use tftp::ProbeSocket;

const DEFAULT_TEST_FILE: &str = "tftpprobe.txt";

/// Sends scripted, possibly malformed, TFTP packets at a server and hex
/// dumps whatever comes back.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Name of the test script file.
    #[arg(long, default_value = DEFAULT_TEST_FILE)]
    testfile: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let file = File::open(&args.testfile).with_context(|| {
        format!(
            "unable to open test file \"{}\" for reading",
            args.testfile.display()
        )
    })?;

    let sock = ProbeSocket::bind((Ipv4Addr::UNSPECIFIED, 0).into())
        .context("unable to open UDP socket")?;

    let mut interpreter = Interpreter::new(sock);
    interpreter.run(BufReader::new(file)).await
}
