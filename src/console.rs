//! Line-oriented control console.
//!
//! Commands mirror the operator actions of a desktop control panel (start,
//! stop, report, filter management). The console runs on its own OS thread
//! and drives the async [`ProxyServer`] through a runtime [`Handle`].

use crate::server::ProxyServer;
use std::io::{BufRead, Write};
use std::str::FromStr;
use tokio::runtime::Handle;

pub const HELP: &str = "\
Commands:
  start          start accepting connections
  stop           stop accepting new connections
  report         write the request log to the report file
  block <host>   add a host to the filter
  blocked        display current filtered hosts
  log            print the request log
  stats          print connection counters
  about          version information
  help           this text
  exit | quit    stop the proxy and exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Stop,
    Report,
    Block(String),
    Blocked,
    Log,
    Stats,
    About,
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("unknown command '{0}', type 'help' for a list")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let name = parts.next().unwrap_or_default().to_ascii_lowercase();
        let arg = parts.next();

        let command = match name.as_str() {
            "start" => Command::Start,
            "stop" => Command::Stop,
            "report" => Command::Report,
            "block" => match arg {
                Some(host) => Command::Block(host.to_string()),
                None => return Err(CommandError::Usage("block <host>")),
            },
            "blocked" => Command::Blocked,
            "log" => Command::Log,
            "stats" => Command::Stats,
            "about" => Command::About,
            "help" | "?" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        Ok(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleExit {
    /// The operator asked to exit.
    Quit,
    /// Input reached end-of-file.
    EndOfInput,
}

/// Execute one command. Returns `true` when the console should exit.
///
/// Must not be called from inside the runtime that `handle` points to.
pub fn execute<W: Write>(server: &ProxyServer, handle: &Handle, command: Command, out: &mut W) -> std::io::Result<bool> {
    match command {
        Command::Start => match handle.block_on(server.start()) {
            Ok(addr) => writeln!(out, "Proxy started on {}", addr)?,
            Err(e) => writeln!(out, "Could not start proxy: {}", e)?,
        },
        Command::Stop => {
            if server.is_running() {
                server.stop();
                writeln!(out, "Proxy stopped")?;
            } else {
                writeln!(out, "Proxy is not running")?;
            }
        }
        Command::Report => match handle.block_on(server.generate_report()) {
            Ok(path) => writeln!(out, "Report generated: {}", path.display())?,
            Err(e) => writeln!(out, "Could not generate report: {}", e)?,
        },
        Command::Block(host) => {
            if server.add_blocked_host(host.clone()) {
                writeln!(out, "Blocked {}", host)?;
            } else {
                writeln!(out, "{} is already blocked", host)?;
            }
        }
        Command::Blocked => {
            let hosts = server.list_blocked_hosts();
            if hosts.is_empty() {
                writeln!(out, "No filtered hosts")?;
            }
            for host in hosts {
                writeln!(out, "{}", host)?;
            }
        }
        Command::Log => {
            for record in server.log_records() {
                writeln!(out, "{}", record)?;
            }
        }
        Command::Stats => {
            let s = server.stats();
            writeln!(
                out,
                "total={} active={} blocked={} tunnels={} cache_hits={} cache_stores={} failed={} in={}B out={}B",
                s.total, s.active, s.blocked, s.tunnels, s.cache_hits, s.cache_stores, s.failed, s.bytes_in, s.bytes_out
            )?;
        }
        Command::About => {
            writeln!(out, "{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))?;
            writeln!(out, "{}", env!("CARGO_PKG_DESCRIPTION"))?;
        }
        Command::Help => writeln!(out, "{}", HELP)?,
        Command::Exit => return Ok(true),
    }
    Ok(false)
}

/// Read commands from `input` until `exit` or end-of-file.
pub fn run<R: BufRead, W: Write>(
    server: &ProxyServer,
    handle: &Handle,
    input: R,
    mut out: W,
) -> std::io::Result<ConsoleExit> {
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Command>() {
            Ok(command) => {
                if execute(server, handle, command, &mut out)? {
                    return Ok(ConsoleExit::Quit);
                }
            }
            Err(e) => writeln!(out, "{}", e)?,
        }
        out.flush()?;
    }

    Ok(ConsoleExit::EndOfInput)
}
