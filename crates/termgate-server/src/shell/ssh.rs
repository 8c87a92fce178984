//! SSH shells via libssh2.
//!
//! Connect and auth run on the blocking pool under the connect bound. Once the
//! pty is up, the session switches to non-blocking mode and a dedicated thread
//! shuttles bytes between the channel and the tokio side.

use super::{ShellAuth, ShellCommand, ShellConnector, ShellEvent, ShellHandle, ShellTarget};
use async_trait::async_trait;
use ssh2::{Channel, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use termgate_core::{GateError, GateResult};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const PTY_TYPE: &str = "xterm";
const READ_CHUNK: usize = 4096;
const IDLE_SLEEP: Duration = Duration::from_millis(10);
/// libssh2 LIBSSH2_ERROR_TIMEOUT
const SSH_ERROR_TIMEOUT: i32 = -9;
/// libssh2 LIBSSH2_ERROR_EAGAIN
const SSH_ERROR_EAGAIN: i32 = -37;
const MAX_WOULD_BLOCK_RETRIES: u32 = 500;

pub struct SshConnector {
    connect_timeout: Duration,
}

impl SshConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn open(&self, target: ShellTarget, cols: u16, rows: u16) -> GateResult<ShellHandle> {
        let bound = self.connect_timeout;
        let host = format!("{}:{}", target.host, target.port);
        debug!(%host, auth = target.auth.method().as_str(), "opening ssh shell");

        let work = tokio::task::spawn_blocking(move || connect_blocking(&target, cols, rows, bound));
        let (session, channel) = match tokio::time::timeout(bound, work).await {
            Err(_) => return Err(GateError::ConnectTimeout(bound)),
            Ok(Err(e)) => return Err(GateError::Shell(format!("connect task failed: {e}"))),
            Ok(Ok(result)) => result?,
        };

        info!(%host, cols, rows, "ssh shell ready");
        spawn_io_thread(host, session, channel)
    }
}

fn connect_blocking(
    target: &ShellTarget,
    cols: u16,
    rows: u16,
    bound: Duration,
) -> GateResult<(Session, Channel)> {
    let endpoint = format!("{}:{}", target.host, target.port);
    let addr = endpoint
        .to_socket_addrs()
        .map_err(|e| GateError::DeviceUnavailable(format!("{endpoint}: {e}")))?
        .next()
        .ok_or_else(|| GateError::DeviceUnavailable(format!("{endpoint}: no address")))?;

    let tcp = TcpStream::connect_timeout(&addr, bound).map_err(|e| match e.kind() {
        ErrorKind::TimedOut => GateError::ConnectTimeout(bound),
        _ => GateError::DeviceUnavailable(format!("{endpoint}: {e}")),
    })?;

    let mut session = Session::new().map_err(|e| GateError::Shell(e.to_string()))?;
    session.set_timeout(bound.as_millis().min(u32::MAX as u128) as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(|e| {
        if e.code() == ssh2::ErrorCode::Session(SSH_ERROR_TIMEOUT) {
            GateError::ConnectTimeout(bound)
        } else {
            GateError::Shell(format!("ssh handshake failed: {e}"))
        }
    })?;

    let auth = match &target.auth {
        ShellAuth::Password(password) => session.userauth_password(&target.username, password),
        ShellAuth::PrivateKey(pem) => {
            session.userauth_pubkey_memory(&target.username, None, pem, None)
        }
    };
    auth.map_err(|e| GateError::Auth(e.message().to_string()))?;
    if !session.authenticated() {
        return Err(GateError::Auth("rejected by server".to_string()));
    }

    let shell_err = |e: ssh2::Error| GateError::Shell(e.to_string());
    let mut channel = session.channel_session().map_err(shell_err)?;
    channel
        .request_pty(PTY_TYPE, None, Some((cols as u32, rows as u32, 0, 0)))
        .map_err(shell_err)?;
    channel.shell().map_err(shell_err)?;

    session.set_timeout(0);
    session.set_blocking(false);
    Ok((session, channel))
}

fn spawn_io_thread(host: String, session: Session, channel: Channel) -> GateResult<ShellHandle> {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    std::thread::Builder::new()
        .name(format!("ssh-{host}"))
        .spawn(move || {
            let reason = io_loop(channel, input_rx, &event_tx);
            debug!(%host, %reason, "ssh shell ended");
            drop(session);
            let _ = event_tx.send(ShellEvent::Closed { reason });
        })
        .map_err(|e| GateError::Shell(format!("failed to start shell thread: {e}")))?;

    Ok(ShellHandle {
        input: input_tx,
        events: event_rx,
    })
}

/// Runs until the remote side closes, the session side goes away, or an I/O
/// error. Returns the reason.
fn io_loop(
    mut channel: Channel,
    mut commands: mpsc::UnboundedReceiver<ShellCommand>,
    events: &mpsc::UnboundedSender<ShellEvent>,
) -> String {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        loop {
            match commands.try_recv() {
                Ok(ShellCommand::Write(data)) => {
                    if let Err(e) = write_all(&mut channel, &data) {
                        return format!("write failed: {e}");
                    }
                }
                Ok(ShellCommand::Resize { cols, rows }) => {
                    let resized = retry(|| {
                        channel.request_pty_size(cols as u32, rows as u32, None, None)
                    });
                    if let Err(e) = resized {
                        warn!(error = %e, cols, rows, "pty resize failed");
                    }
                }
                Ok(ShellCommand::Close) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    let _ = channel.close();
                    return "closed by gateway".to_string();
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                if channel.eof() {
                    return "remote shell exited".to_string();
                }
                std::thread::sleep(IDLE_SLEEP);
            }
            Ok(n) => {
                if events.send(ShellEvent::Output(buf[..n].to_vec())).is_err() {
                    let _ = channel.close();
                    return "session dropped".to_string();
                }
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                if channel.eof() {
                    return "remote shell exited".to_string();
                }
                std::thread::sleep(IDLE_SLEEP);
            }
            Err(e) => return format!("read failed: {e}"),
        }
    }
}

fn write_all(channel: &mut Channel, mut data: &[u8]) -> std::io::Result<()> {
    let mut stalls = 0;
    while !data.is_empty() {
        match channel.write(data) {
            Ok(0) => return Err(std::io::Error::new(ErrorKind::WriteZero, "channel closed")),
            Ok(n) => {
                data = &data[n..];
                stalls = 0;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                stalls += 1;
                if stalls > MAX_WOULD_BLOCK_RETRIES {
                    return Err(std::io::Error::new(ErrorKind::TimedOut, "channel stalled"));
                }
                std::thread::sleep(IDLE_SLEEP);
            }
            Err(e) => return Err(e),
        }
    }
    loop {
        match channel.flush() {
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(IDLE_SLEEP),
            other => return other,
        }
    }
}

/// Retry a libssh2 call that may report EAGAIN in non-blocking mode.
fn retry<F>(mut f: F) -> Result<(), ssh2::Error>
where
    F: FnMut() -> Result<(), ssh2::Error>,
{
    let mut attempts = 0;
    loop {
        match f() {
            Err(e) if is_would_block(&e) && attempts < MAX_WOULD_BLOCK_RETRIES => {
                attempts += 1;
                std::thread::sleep(IDLE_SLEEP);
            }
            other => return other,
        }
    }
}

fn is_would_block(e: &ssh2::Error) -> bool {
    e.code() == ssh2::ErrorCode::Session(SSH_ERROR_EAGAIN)
}
