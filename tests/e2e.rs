//! End-to-end exercise of the demo binary: one server process, two
//! client processes, chat lines crossing between them.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(3);

#[tokio::test]
async fn cli_chat_end_to_end() -> Result<()> {
    let mut server = Proc::spawn(&["serve", "--listen", "127.0.0.1:0"])?;
    let banner = server.next_line("the listen banner").await?;
    let addr = banner
        .strip_prefix("listening on ")
        .with_context(|| format!("unexpected server banner: {banner}"))?
        .to_string();
    // The server keeps printing join/leave notices that nobody reads;
    // the handful of lines this scenario produces fits the pipe buffer.

    let mut alice = client(&addr, "alice").await?;

    // A self-echo proves the server has registered the sender, so later
    // broadcasts cannot race past a client that is still connecting.
    alice.say("checking in").await?;
    alice.expect("<alice> checking in").await?;

    let mut bob = client(&addr, "bob").await?;
    bob.say("hi all").await?;
    bob.expect("<bob> hi all").await?;
    alice.expect("<bob> hi all").await?;

    alice.say("Hello from Alice").await?;
    bob.expect("<alice> Hello from Alice").await?;
    alice.expect("<alice> Hello from Alice").await?;

    // Alice leaves gracefully; Bob keeps chatting with himself.
    alice.say("/quit").await?;
    alice.expect("*** leaving chat").await?;
    alice.wait_success("alice").await?;

    bob.say("still here").await?;
    bob.expect("<bob> still here").await?;
    bob.say("/quit").await?;
    bob.expect("*** leaving chat").await?;
    bob.wait_success("bob").await?;

    // The server stays up after clients disconnect; terminate it.
    let _ = server.child.kill().await;
    Ok(())
}

async fn client(addr: &str, nickname: &str) -> Result<Proc> {
    let mut proc = Proc::spawn(&["client", "--nickname", nickname, "--server", addr])?;
    proc.expect(&format!("*** connected to {addr}")).await?;
    Ok(proc)
}

/// One `wireline` process with piped stdin and line-buffered stdout.
struct Proc {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Proc {
    fn spawn(args: &[&str]) -> Result<Proc> {
        let mut child = Command::new(assert_cmd::cargo::cargo_bin!("wireline"))
            .args(args)
            .env("RUST_LOG", "warn")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn wireline {}", args[0]))?;
        let stdin = child.stdin.take().context("stdin missing after spawn")?;
        let stdout = child.stdout.take().context("stdout missing after spawn")?;
        Ok(Proc {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn say(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(format!("{line}\n").as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn next_line(&mut self, waiting_for: &str) -> Result<String> {
        timeout(READ_TIMEOUT, self.stdout.next_line())
            .await
            .map_err(|_| anyhow!("timed out waiting for {waiting_for}"))?
            .with_context(|| format!("failed to read while waiting for {waiting_for}"))?
            .ok_or_else(|| anyhow!("stdout closed while waiting for {waiting_for}"))
    }

    async fn expect(&mut self, wanted: &str) -> Result<()> {
        let line = self.next_line(&format!("'{wanted}'")).await?;
        if line != wanted {
            return Err(anyhow!("expected '{wanted}', got '{line}'"));
        }
        Ok(())
    }

    async fn wait_success(mut self, name: &str) -> Result<()> {
        let status = self
            .child
            .wait()
            .await
            .with_context(|| format!("failed to await {name} process"))?;
        if !status.success() {
            return Err(anyhow!("{name} exited with status {status}"));
        }
        Ok(())
    }
}
