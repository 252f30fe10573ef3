//! rdbg debugger server.
//!
//! Started by a debugger controller. Reads the three line handshake from stdin
//! (support library path, channel kind, encoded controller reference), connects back
//! to the controller, registers itself and serves debugging requests until the
//! controller asks it to exit.

use anyhow::Context;
use clap::Parser;
use rdbg::server::host::{serve, Handshake};
use std::io::{stdin, BufReader};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Turn off server logs
    #[clap(short, long)]
    quiet: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    rdbg::log::init();
    if args.quiet {
        rdbg::log::disable();
    }

    let handshake = Handshake::read(&mut BufReader::new(stdin().lock()))
        .context("read controller handshake")?;
    serve(&handshake).context("serve debugger controller")?;
    Ok(())
}
