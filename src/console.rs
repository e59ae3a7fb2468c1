//! Operator console: reads text commands and runs them against a node.

use rustbully_node::{msg::NODE_PORT, NodeHandle};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::debug;

const PROMPT: &str = "prompt> ";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Print the node.
    Node,
    /// Print the node identity.
    Id,
    Neighbors,
    Leader,
    Connect { host: String, port: u16 },
    Elect,
    /// Stop accepting inbound links and end the console.
    Shutdown,
    /// Accepted but does nothing yet.
    Broadcast,
    Empty,
    Usage(&'static str),
    Unknown(Vec<String>),
}

impl Command {
    pub fn parse(line: &str) -> Command {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some(cmd) = words.first() else {
            return Command::Empty;
        };
        match *cmd {
            "node" => Command::Node,
            "id" => Command::Id,
            "neighbors" => Command::Neighbors,
            "leader" => Command::Leader,
            "elect" => Command::Elect,
            "shutdown" => Command::Shutdown,
            "connect" => match (words.get(1), words.get(2)) {
                (Some(host), None) => Command::Connect {
                    host: host.to_string(),
                    port: NODE_PORT,
                },
                (Some(host), Some(port)) => match port.parse() {
                    Ok(port) => Command::Connect {
                        host: host.to_string(),
                        port,
                    },
                    Err(_) => Command::Usage("connect <host> [port]"),
                },
                _ => Command::Usage("connect <host> [port]"),
            },
            c if c.contains("broadcast") => Command::Broadcast,
            _ => Command::Unknown(words.iter().map(|w| w.to_string()).collect()),
        }
    }
}

pub struct Console {
    node: NodeHandle,
}

impl Console {
    pub fn new(node: NodeHandle) -> Self {
        Self { node }
    }

    /// Runs commands from `input` until end of input or `shutdown`.
    pub async fn run<R, W>(&self, input: R, out: &mut W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: Write,
    {
        let mut lines = input.lines();
        loop {
            write!(out, "{PROMPT}")?;
            out.flush()?;
            let Some(line) = lines.next_line().await? else {
                return Ok(());
            };
            let cmd = Command::parse(&line);
            let done = cmd == Command::Shutdown;
            self.process(cmd, out).await?;
            if done {
                return Ok(());
            }
        }
    }

    pub async fn process<W: Write>(&self, cmd: Command, out: &mut W) -> std::io::Result<()> {
        match cmd {
            Command::Node => writeln!(
                out,
                "<Node {} at {}>",
                self.node.identity(),
                self.node.local_addr()
            )?,
            Command::Id => writeln!(out, "{}", self.node.identity())?,
            Command::Neighbors => match self.node.summary().await {
                Ok(summary) => {
                    let neighbors: Vec<String> = summary
                        .neighbors
                        .iter()
                        .map(|n| {
                            let identity = n.identity.as_deref().unwrap_or("?");
                            format!("{identity}@{}", n.remote_addr)
                        })
                        .collect();
                    writeln!(out, "[{}]", neighbors.join(", "))?;
                }
                Err(e) => writeln!(out, "error: {e}")?,
            },
            Command::Leader => match self.node.summary().await {
                Ok(summary) => {
                    let leader = summary.leader.as_deref().unwrap_or("unknown");
                    writeln!(
                        out,
                        "leader: {leader} (candidate: {}, phase: {:?})",
                        summary.is_candidate, summary.phase
                    )?;
                }
                Err(e) => writeln!(out, "error: {e}")?,
            },
            Command::Connect { host, port } => {
                writeln!(out, "connecting to {host} port {port}")?;
                if let Err(e) = self.node.connect_host(&host, port).await {
                    writeln!(out, "error: {e}")?;
                }
            }
            Command::Elect => {
                if let Err(e) = self.node.start_election().await {
                    writeln!(out, "error: {e}")?;
                }
            }
            Command::Shutdown => {
                if let Err(e) = self.node.shutdown().await {
                    writeln!(out, "error: {e}")?;
                }
            }
            Command::Broadcast => debug!("broadcast from the console is not wired up"),
            Command::Empty => writeln!(out, "(*≧∀≦*)")?,
            Command::Usage(usage) => writeln!(out, "usage: {usage}")?,
            Command::Unknown(words) => writeln!(out, "Command '{words:?}' unknown.")?,
        }
        Ok(())
    }
}
