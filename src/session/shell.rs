//! Shell channel task
//!
//! One task owns the shell channel. It forwards output to the event sink,
//! runs the login scripts over it and applies commands from the session.

use rand::RngCore;
use russh::client::Msg;
use russh::{Channel, ChannelMsg, Sig};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::events::EventSink;
use crate::scripts::LoginScriptRunner;
use crate::ssh::{ErrorClass, HandleController, SshError};

const TERM_TYPE: &str = "xterm-256color";
const X11_AUTH_PROTOCOL: &str = "MIT-MAGIC-COOKIE-1";

/// Commands accepted by the shell task
#[derive(Debug)]
pub enum ShellCommand {
    Data(Vec<u8>),
    Resize(u32, u32),
    Signal(Sig),
    Close,
}

/// Map a signal name (`INT`, `SIGINT`, ...) to russh's enum
pub fn signal_from_name(name: &str) -> Sig {
    let name = name.trim().trim_start_matches("SIG").to_uppercase();
    match name.as_str() {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        _ => Sig::Custom(name),
    }
}

/// Random 128-bit cookie, hex encoded
pub fn x11_cookie() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub struct ShellOptions {
    pub cols: u32,
    pub rows: u32,
    pub x11: bool,
}

/// An opened shell plus any output that arrived before the shell reply
pub struct OpenedShell {
    channel: Channel<Msg>,
    early_output: Vec<Vec<u8>>,
}

/// Wait for the next Success/Failure reply, keeping output seen meanwhile
async fn next_reply(channel: &mut Channel<Msg>, early: &mut Vec<Vec<u8>>) -> Option<bool> {
    loop {
        match channel.wait().await? {
            ChannelMsg::Success => return Some(true),
            ChannelMsg::Failure => return Some(false),
            ChannelMsg::Data { data } => early.push(data.to_vec()),
            ChannelMsg::ExtendedData { data, ext: 1 } => early.push(data.to_vec()),
            ChannelMsg::Close | ChannelMsg::Eof => return None,
            other => debug!("Ignoring {:?} while opening shell", other),
        }
    }
}

/// Open the session channel, request X11 (optional), a PTY and a shell
pub async fn open_shell(
    controller: &HandleController,
    options: &ShellOptions,
    events: &EventSink,
) -> Result<OpenedShell, SshError> {
    let mut channel = controller.open_session_channel().await?;
    let mut early_output = Vec::new();

    if options.x11 {
        channel
            .request_x11(true, true, X11_AUTH_PROTOCOL, x11_cookie(), 0)
            .await
            .map_err(|e| SshError::ChannelError(format!("X11 request failed: {}", e)))?;
        match next_reply(&mut channel, &mut early_output).await {
            Some(true) => debug!("X11 forwarding accepted"),
            Some(false) => {
                events.service_message(" X  Remote rejected X11 forwarding");
                events.service_message("    Make sure `xauth` is installed on the remote side");
                events.error(ErrorClass::X11, "X11 forwarding request rejected");
            }
            None => {
                return Err(SshError::ChannelError(
                    "Channel closed while requesting X11 forwarding".into(),
                ))
            }
        }
    }

    channel
        .request_pty(false, TERM_TYPE, options.cols, options.rows, 0, 0, &[])
        .await
        .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))?;

    channel
        .request_shell(true)
        .await
        .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))?;
    match next_reply(&mut channel, &mut early_output).await {
        Some(true) => Ok(OpenedShell {
            channel,
            early_output,
        }),
        Some(false) => Err(SshError::ChannelError("Shell request rejected".into())),
        None => Err(SshError::ChannelError(
            "Channel closed while requesting a shell".into(),
        )),
    }
}

/// Write script commands, one line each
async fn send_commands(channel: &Channel<Msg>, commands: Vec<String>) -> Result<(), russh::Error> {
    for command in commands {
        let line = format!("{}\n", command);
        channel.data(line.as_bytes()).await?;
    }
    Ok(())
}

pub struct ShellTask {
    pub label: String,
    pub events: EventSink,
    /// Carries its own deadline, see [`LoginScriptRunner::with_timeout`]
    pub scripts: LoginScriptRunner,
}

impl ShellTask {
    /// Spawn the shell loop. `exit_tx` fires when the channel ends or a
    /// `Close` command is processed.
    pub fn spawn(
        self,
        shell: OpenedShell,
        mut cmd_rx: mpsc::Receiver<ShellCommand>,
        exit_tx: oneshot::Sender<()>,
    ) {
        tokio::spawn(async move {
            let ShellTask {
                label,
                events,
                mut scripts,
            } = self;
            let OpenedShell {
                mut channel,
                early_output,
            } = shell;

            debug!("Shell task started for {}", label);

            if let Err(e) = send_commands(&channel, scripts.start()).await {
                warn!("Failed to send login script for {}: {}", label, e);
            }

            for data in early_output {
                events.output(&data);
                let pass = scripts.feed(&data);
                if let Err(e) = send_commands(&channel, pass.commands).await {
                    warn!("Failed to send login script for {}: {}", label, e);
                }
            }

            loop {
                let armed = scripts.deadline();
                let script_timer = async move {
                    match armed {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(ShellCommand::Data(data)) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to write to shell for {}: {}", label, e);
                                break;
                            }
                        }
                        Some(ShellCommand::Resize(cols, rows)) => {
                            if let Err(e) = channel.window_change(cols, rows, 0, 0).await {
                                warn!("Failed to resize PTY for {}: {}", label, e);
                            } else {
                                debug!("PTY resized to {}x{} for {}", cols, rows, label);
                            }
                        }
                        Some(ShellCommand::Signal(sig)) => {
                            if let Err(e) = channel.signal(sig).await {
                                warn!("Failed to send signal for {}: {}", label, e);
                            }
                        }
                        Some(ShellCommand::Close) | None => {
                            info!("Closing shell for {}", label);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    },

                    msg = channel.wait() => match msg {
                        Some(ChannelMsg::Data { data }) => {
                            events.output(&data);
                            let pass = scripts.feed(&data);
                            if let Err(e) = send_commands(&channel, pass.commands).await {
                                warn!("Failed to send login script for {}: {}", label, e);
                            }
                        }
                        Some(ChannelMsg::ExtendedData { data, ext }) => {
                            if ext == 1 {
                                events.output(&data);
                            }
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Shell exit status {} for {}", exit_status, label);
                        }
                        Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                            info!("Shell exit signal {:?} for {}", signal_name, label);
                        }
                        Some(ChannelMsg::Eof) => debug!("Shell EOF for {}", label),
                        Some(ChannelMsg::Close) | None => {
                            info!("Shell session ended for {}", label);
                            break;
                        }
                        Some(_) => {}
                    },

                    _ = script_timer => {
                        if let Some(err) = scripts.expire(Instant::now()) {
                            events.service_message(err.to_string());
                            events.error(ErrorClass::Script, err.to_string());
                        }
                    }
                }
            }

            let _ = exit_tx.send(());
            debug!("Shell task terminated for {}", label);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_names() {
        assert!(matches!(signal_from_name("TERM"), Sig::TERM));
        assert!(matches!(signal_from_name("SIGINT"), Sig::INT));
        assert!(matches!(signal_from_name("hup"), Sig::HUP));
        assert!(matches!(signal_from_name("WINCH"), Sig::Custom(ref n) if n == "WINCH"));
    }

    #[test]
    fn test_x11_cookie_is_random_hex() {
        let a = x11_cookie();
        let b = x11_cookie();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
