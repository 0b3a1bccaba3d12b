//! wsb guest agent
//!
//! Started by the sandbox logon command. Serves the host's execution channel
//! in one of two modes:
//!
//! - `--channel-dir <DIR>`: poll `<DIR>/requests/*.json`, write each reply to
//!   `<DIR>/responses/<id>.json` (tmp file + rename, so the host never reads
//!   a partial reply)
//! - `--listen <ADDR>`: accept TCP connections carrying one JSON request per
//!   line and answer with one JSON response per line
//!
//! Every request is handled on its own thread.

use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

const REQUESTS_DIR: &str = "requests";
const RESPONSES_DIR: &str = "responses";

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Deserialize)]
struct Request {
    id: String,
    #[serde(flatten)]
    body: RequestBody,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBody {
    Execute {
        command: String,
        #[serde(default)]
        env: HashMap<String, String>,
        timeout_secs: u64,
    },
    Ping,
    Shutdown,
}

#[derive(Debug, Serialize)]
struct Response {
    id: String,
    #[serde(flatten)]
    body: ResponseBody,
}

#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBody {
    Execute {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    Pong,
    ShutdownAck,
    Error {
        message: String,
    },
}

#[derive(Debug, PartialEq)]
enum Mode {
    ChannelDir(PathBuf),
    Listen(String),
}

fn main() {
    let mode = match parse_args(std::env::args().skip(1)) {
        Ok(mode) => mode,
        Err(message) => {
            eprintln!("wsb-agent: {}", message);
            eprintln!("usage: wsb-agent --channel-dir <DIR> | --listen <ADDR>");
            std::process::exit(2);
        }
    };

    eprintln!("wsb-agent: starting ({:?})", mode);

    let result = match mode {
        Mode::ChannelDir(root) => run_channel_dir(&root),
        Mode::Listen(addr) => TcpListener::bind(&addr).and_then(serve_listener),
    };

    if let Err(e) = result {
        eprintln!("wsb-agent: fatal: {}", e);
        std::process::exit(1);
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Mode, String> {
    let mode = match args.next().as_deref() {
        Some("--channel-dir") => args
            .next()
            .map(|dir| Mode::ChannelDir(PathBuf::from(dir)))
            .ok_or("--channel-dir needs a directory")?,
        Some("--listen") => args
            .next()
            .map(Mode::Listen)
            .ok_or("--listen needs an address")?,
        Some(other) => return Err(format!("unknown argument '{}'", other)),
        None => return Err("no channel given".to_string()),
    };

    match args.next() {
        Some(extra) => Err(format!("unexpected argument '{}'", extra)),
        None => Ok(mode),
    }
}

// ============================================================================
// Shared folder channel
// ============================================================================

fn run_channel_dir(root: &Path) -> io::Result<()> {
    let requests = root.join(REQUESTS_DIR);
    let responses = root.join(RESPONSES_DIR);
    std::fs::create_dir_all(&requests)?;
    std::fs::create_dir_all(&responses)?;

    eprintln!("wsb-agent: polling {}", requests.display());

    loop {
        for claimed in claim_requests(&requests)? {
            let responses = responses.clone();
            thread::spawn(move || match serve_request_file(&claimed, &responses) {
                Ok(true) => power_off(),
                Ok(false) => {}
                Err(e) => eprintln!("wsb-agent: {}: {}", claimed.display(), e),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Rename every pending `<id>.json` to `<id>.processing` so each request is
/// picked up exactly once.
fn claim_requests(requests: &Path) -> io::Result<Vec<PathBuf>> {
    let mut claimed = Vec::new();
    for entry in std::fs::read_dir(requests)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }
        let processing = path.with_extension("processing");
        // The host may have cancelled the request in the meantime.
        if std::fs::rename(&path, &processing).is_ok() {
            claimed.push(processing);
        }
    }
    Ok(claimed)
}

/// Answer one claimed request file. Returns true if the host asked for shutdown.
fn serve_request_file(claimed: &Path, responses: &Path) -> io::Result<bool> {
    let content = std::fs::read_to_string(claimed)?;
    let _ = std::fs::remove_file(claimed);

    let fallback_id = claimed
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default();
    let response = process_request(&content, fallback_id);
    let shutdown = response.body == ResponseBody::ShutdownAck;

    let json = serde_json::to_vec(&response)?;
    let tmp = responses.join(format!("{}.json.tmp", response.id));
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, responses.join(format!("{}.json", response.id)))?;

    Ok(shutdown)
}

// ============================================================================
// TCP channel
// ============================================================================

fn serve_listener(listener: TcpListener) -> io::Result<()> {
    eprintln!("wsb-agent: listening on {}", listener.local_addr()?);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                thread::spawn(move || match handle_connection(stream) {
                    Ok(true) => power_off(),
                    Ok(false) => {}
                    Err(e) => eprintln!("wsb-agent: connection error: {}", e),
                });
            }
            Err(e) => eprintln!("wsb-agent: accept error: {}", e),
        }
    }
    Ok(())
}

/// Serve JSON lines until the peer closes. Returns true after a shutdown request.
fn handle_connection(stream: TcpStream) -> io::Result<bool> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;
    let mut line = String::new();

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(false);
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = process_request(&line, "");
        writeln!(writer, "{}", serde_json::to_string(&response)?)?;
        writer.flush()?;

        if response.body == ResponseBody::ShutdownAck {
            return Ok(true);
        }
    }
}

// ============================================================================
// Request handling
// ============================================================================

/// Parse and answer one request. Unparseable input is answered with an
/// error under `fallback_id`.
fn process_request(raw: &str, fallback_id: &str) -> Response {
    let request: Request = match serde_json::from_str(raw.trim()) {
        Ok(request) => request,
        Err(e) => {
            return Response {
                id: fallback_id.to_string(),
                body: ResponseBody::Error {
                    message: format!("Invalid request: {}", e),
                },
            };
        }
    };

    let body = match request.body {
        RequestBody::Execute {
            command,
            env,
            timeout_secs,
        } => execute_command(&command, &env, Duration::from_secs(timeout_secs.max(1))),
        RequestBody::Ping => ResponseBody::Pong,
        RequestBody::Shutdown => ResponseBody::ShutdownAck,
    };

    Response {
        id: request.id,
        body,
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd.exe");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Run `command` through the guest shell, killing it after `timeout`.
fn execute_command(command: &str, env: &HashMap<String, String>, timeout: Duration) -> ResponseBody {
    eprintln!("wsb-agent: executing: {}", command);

    let spawned = shell(command)
        .envs(env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            return ResponseBody::Error {
                message: format!("Failed to execute command: {}", e),
            }
        }
    };

    let stdout = child.stdout.take().map(read_pipe);
    let stderr = child.stderr.take().map(read_pipe);

    match wait_with_deadline(&mut child, Instant::now() + timeout) {
        Ok(Some(exit_code)) => {
            eprintln!("wsb-agent: command finished with exit code {}", exit_code);
            ResponseBody::Execute {
                exit_code,
                stdout: collect(stdout),
                stderr: collect(stderr),
            }
        }
        // Grandchildren may still hold the pipes open, so readers are not joined.
        Ok(None) => {
            eprintln!("wsb-agent: command timed out after {:?}", timeout);
            ResponseBody::Execute {
                exit_code: -1,
                stdout: String::new(),
                stderr: format!("command timed out after {}s", timeout.as_secs()),
            }
        }
        Err(e) => ResponseBody::Error {
            message: format!("Failed to wait for command: {}", e),
        },
    }
}

/// `Some(exit code)` if the child exited in time, `None` once it was killed.
fn wait_with_deadline(child: &mut Child, deadline: Instant) -> io::Result<Option<i32>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

fn read_pipe<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Power the guest off. Outside Windows the agent just exits.
fn power_off() {
    eprintln!("wsb-agent: shutdown requested");
    if cfg!(windows) {
        if let Err(e) = Command::new("shutdown").args(["/s", "/t", "0"]).spawn() {
            eprintln!("wsb-agent: failed to run shutdown: {}", e);
        }
    }
    std::process::exit(0);
}
