//! Line-oriented control client
//!
//! A small telnet-style client for daemon control ports: option negotiation
//! on connect, prompt-driven login, then strictly serialized command
//! execution with per-command timeouts. A background reader owns the socket's
//! read half and turns bytes into session events; negotiation replies are
//! written from there so they never interleave with command writes badly.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::{CONTROL_CONNECT_TIMEOUT, DEFAULT_COMMAND_TIMEOUT};

use super::options::{
    Negotiation, OptionEvent, OptionNegotiator, Reply, OPT_ECHO, OPT_SUPPRESS_GO_AHEAD,
};
use super::parser::{WireEvent, WireParser, IAC};

/// Connection options for the control client.
#[derive(Debug, Clone)]
pub struct ControlClientConfig {
    /// Prompt that precedes the username, if the server has a login step
    pub login_prompt: Option<String>,
    /// Prompt that precedes the password
    pub password_prompt: Option<String>,
    /// Prompt that signals the server is ready for a command
    pub shell_prompt: String,
    /// Username for the login step
    pub user: Option<String>,
    /// Password for the login step
    pub password: Option<String>,
    /// Request the server to echo
    pub enable_echo: bool,
    /// Require SUPPRESS-GO-AHEAD on both halves; refusal is fatal
    pub suppress_go_ahead: bool,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Default per-command timeout
    pub exec_timeout: Duration,
    /// Timeout for each prompt while connecting
    pub line_timeout: Duration,
}

impl Default for ControlClientConfig {
    fn default() -> Self {
        Self {
            login_prompt: None,
            password_prompt: None,
            shell_prompt: "> ".to_string(),
            user: None,
            password: None,
            enable_echo: true,
            suppress_go_ahead: true,
            connect_timeout: CONTROL_CONNECT_TIMEOUT,
            exec_timeout: DEFAULT_COMMAND_TIMEOUT,
            line_timeout: Duration::from_secs(10),
        }
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection
    Disconnected,
    /// TCP and negotiation in progress
    Connecting,
    /// Ready for commands
    Connected,
    /// Tear-down in progress
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PromptKind {
    Login,
    Password,
    Shell,
}

#[derive(Debug)]
enum SessionEvent {
    Line(String),
    Prompt(PromptKind),
    ProtocolError(String),
    Closed,
}

/// The control client.
pub struct ControlClient {
    config: ControlClientConfig,
    state: ClientState,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    reader: JoinHandle<()>,
    in_flight: bool,
}

impl ControlClient {
    /// Connect, negotiate options, and consume the login/shell prompts.
    pub async fn connect(
        host: &str,
        port: u16,
        config: ControlClientConfig,
    ) -> Result<Self, TransportError> {
        let address = format!("{host}:{port}");
        debug!(%address, "Connecting control client");

        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| TransportError::CommandTimeout {
                command: format!("connect {address}"),
                timeout: config.connect_timeout,
            })??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(Mutex::new(write_half));

        // Initial negotiation: SUPPRESS-GO-AHEAD on both halves, echo from
        // the server. The same automaton then lives in the reader task.
        let mut negotiator = OptionNegotiator::new();
        let mut initial = Vec::new();
        if config.suppress_go_ahead {
            initial.extend(negotiator.request_remote_enable(OPT_SUPPRESS_GO_AHEAD));
            initial.extend(negotiator.request_local_enable(OPT_SUPPRESS_GO_AHEAD));
        }
        if config.enable_echo {
            initial.extend(negotiator.request_remote_enable(OPT_ECHO));
        }
        if !initial.is_empty() {
            let mut bytes = Vec::with_capacity(initial.len() * 3);
            for reply in &initial {
                bytes.extend_from_slice(&encode_reply(*reply));
            }
            writer.lock().await.write_all(&bytes).await?;
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        let reader = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&writer),
            negotiator,
            event_tx,
            config.clone(),
        ));

        let mut client = Self {
            config,
            state: ClientState::Connecting,
            writer,
            events,
            reader,
            in_flight: false,
        };

        if let Err(err) = client.consume_startup_prompts().await {
            client.disconnect().await;
            return Err(err);
        }

        client.state = ClientState::Connected;
        Ok(client)
    }

    async fn consume_startup_prompts(&mut self) -> Result<(), TransportError> {
        if self.config.login_prompt.is_some() {
            self.wait_for_prompt(PromptKind::Login).await?;
            let user = self.config.user.clone().unwrap_or_default();
            self.send_line(&user).await?;
        }
        if self.config.password_prompt.is_some() {
            self.wait_for_prompt(PromptKind::Password).await?;
            let password = self.config.password.clone().unwrap_or_default();
            self.send_line(&password).await?;
        }
        self.wait_for_prompt(PromptKind::Shell).await
    }

    async fn wait_for_prompt(&mut self, expected: PromptKind) -> Result<(), TransportError> {
        let deadline = tokio::time::Instant::now() + self.config.line_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let event = tokio::time::timeout(remaining, self.events.recv())
                .await
                .map_err(|_| TransportError::CommandTimeout {
                    command: format!("wait for {expected:?} prompt"),
                    timeout: self.config.line_timeout,
                })?;
            match event {
                Some(SessionEvent::Prompt(kind)) if kind == expected => return Ok(()),
                Some(SessionEvent::Prompt(other)) => {
                    trace!(?other, "Ignoring out-of-order prompt");
                }
                Some(SessionEvent::Line(line)) => {
                    trace!(%line, "Banner line");
                }
                Some(SessionEvent::ProtocolError(message)) => {
                    return Err(TransportError::ControlProtocol(message));
                }
                Some(SessionEvent::Closed) | None => {
                    return Err(TransportError::Disconnected);
                }
            }
        }
    }

    /// Connection state.
    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Whether the client is connected with no command in flight.
    pub fn is_idle(&self) -> bool {
        self.state == ClientState::Connected && !self.in_flight
    }

    /// Whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Write a line without waiting for a response.
    pub async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.write_all(b"\r\n").await?;
        writer.flush().await?;
        Ok(())
    }

    /// Run a command and collect its output with the default timeout.
    pub async fn exec(&mut self, command: &str) -> Result<String, TransportError> {
        self.exec_with_timeout(command, self.config.exec_timeout)
            .await
    }

    /// Run a command and collect output lines until the shell prompt.
    ///
    /// Only one command may be in flight at a time; re-entry is rejected.
    pub async fn exec_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        if self.state != ClientState::Connected {
            return Err(TransportError::Disconnected);
        }
        if self.in_flight {
            return Err(TransportError::ControlProtocol(format!(
                "command '{command}' rejected: another command is in flight"
            )));
        }

        self.in_flight = true;
        let result = self.run_exec(command, timeout).await;
        self.in_flight = false;
        result
    }

    async fn run_exec(&mut self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        debug!(%command, "Executing control command");
        {
            let mut writer = self.writer.lock().await;
            writer.write_all(command.as_bytes()).await?;
            writer.write_all(b"\r\n").await?;
            writer.flush().await?;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let mut lines = Vec::new();
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or(Duration::ZERO);
            let event = tokio::time::timeout(remaining, self.events.recv())
                .await
                .map_err(|_| TransportError::CommandTimeout {
                    command: command.to_string(),
                    timeout,
                })?;
            match event {
                Some(SessionEvent::Line(line)) => lines.push(line),
                Some(SessionEvent::Prompt(PromptKind::Shell)) => break,
                Some(SessionEvent::Prompt(_)) => {}
                Some(SessionEvent::ProtocolError(message)) => {
                    return Err(TransportError::ControlProtocol(message));
                }
                Some(SessionEvent::Closed) | None => {
                    return Err(TransportError::Disconnected);
                }
            }
        }

        Ok(clean_response(command, lines))
    }

    /// Tear the connection down. Idempotent; pending waits observe a
    /// disconnect error through the closed event channel.
    pub async fn disconnect(&mut self) {
        if self.state == ClientState::Disconnected {
            return;
        }
        self.state = ClientState::Disconnecting;
        self.reader.abort();
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        self.in_flight = false;
        self.state = ClientState::Disconnected;
        debug!("Control client disconnected");
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn encode_reply(reply: Reply) -> [u8; 3] {
    let verb = match reply.negotiation {
        Negotiation::Will => 251,
        Negotiation::Wont => 252,
        Negotiation::Do => 253,
        Negotiation::Dont => 254,
    };
    [IAC, verb, reply.option]
}

/// Strip the echoed command, apply backspace deletion, trim whitespace and
/// non-printable characters, and drop empty lines.
fn clean_response(command: &str, lines: Vec<String>) -> String {
    let mut cleaned: Vec<String> = lines
        .into_iter()
        .map(|line| clean_line(&line))
        .filter(|line| !line.is_empty())
        .collect();
    if cleaned.first().map(String::as_str) == Some(command.trim()) {
        cleaned.remove(0);
    }
    cleaned.join("\n")
}

fn clean_line(line: &str) -> String {
    let mut chars: Vec<char> = Vec::with_capacity(line.len());
    for ch in line.chars() {
        if ch == '\u{8}' {
            chars.pop();
        } else {
            chars.push(ch);
        }
    }
    chars
        .into_iter()
        .filter(|ch| !ch.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}

async fn reader_loop(
    mut read_half: OwnedReadHalf,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    mut negotiator: OptionNegotiator,
    events: mpsc::UnboundedSender<SessionEvent>,
    config: ControlClientConfig,
) {
    let mut parser = WireParser::new();
    let mut line = String::new();
    let mut buffer = [0u8; 4096];

    loop {
        let read = match read_half.read(&mut buffer).await {
            Ok(0) => {
                let _ = events.send(SessionEvent::Closed);
                return;
            }
            Ok(read) => read,
            Err(err) => {
                let _ = events.send(SessionEvent::ProtocolError(err.to_string()));
                let _ = events.send(SessionEvent::Closed);
                return;
            }
        };

        for &byte in &buffer[..read] {
            match parser.push(byte) {
                Some(WireEvent::Text(b'\n')) => {
                    let _ = events.send(SessionEvent::Line(std::mem::take(&mut line)));
                }
                Some(WireEvent::Text(byte)) => {
                    line.push(byte as char);
                    if let Some(kind) = prompt_match(&line, &config) {
                        line.clear();
                        let _ = events.send(SessionEvent::Prompt(kind));
                    }
                }
                Some(WireEvent::Negotiate(negotiation, option)) => {
                    let (reply, event) = negotiator.receive(negotiation, option);
                    if let Some(reply) = reply {
                        let bytes = encode_reply(reply);
                        if writer.lock().await.write_all(&bytes).await.is_err() {
                            let _ = events.send(SessionEvent::Closed);
                            return;
                        }
                    }
                    if let Some(event) = event {
                        handle_option_event(event, &config, &events);
                    }
                }
                Some(WireEvent::Command(command)) => {
                    trace!(command, "Ignoring bare protocol command");
                }
                None => {}
            }
        }
    }
}

fn handle_option_event(
    event: OptionEvent,
    config: &ControlClientConfig,
    events: &mpsc::UnboundedSender<SessionEvent>,
) {
    match event {
        OptionEvent::RemoteRefused(OPT_SUPPRESS_GO_AHEAD)
        | OptionEvent::LocalRefused(OPT_SUPPRESS_GO_AHEAD)
            if config.suppress_go_ahead =>
        {
            let _ = events.send(SessionEvent::ProtocolError(
                "peer refused SUPPRESS-GO-AHEAD".to_string(),
            ));
        }
        OptionEvent::RemoteRefused(OPT_ECHO) => {
            warn!("Server refused to echo; responses may include local noise");
        }
        other => trace!(?other, "Option settled"),
    }
}

fn prompt_match(partial: &str, config: &ControlClientConfig) -> Option<PromptKind> {
    if let Some(login) = &config.login_prompt {
        if partial.ends_with(login.as_str()) {
            return Some(PromptKind::Login);
        }
    }
    if let Some(password) = &config.password_prompt {
        if partial.ends_with(password.as_str()) {
            return Some(PromptKind::Password);
        }
    }
    if partial.ends_with(config.shell_prompt.as_str()) {
        return Some(PromptKind::Shell);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_line_applies_backspaces_and_trims() {
        assert_eq!(clean_line("abcd\u{8}\u{8}ef"), "abef");
        assert_eq!(clean_line("  spaced \t"), "spaced");
        assert_eq!(clean_line("bell\u{7}!"), "bell!");
    }

    #[test]
    fn clean_response_drops_echo_and_empty_lines() {
        let response = clean_response(
            "reset run",
            vec![
                "reset run".to_string(),
                String::new(),
                "target state: running".to_string(),
            ],
        );
        assert_eq!(response, "target state: running");
    }

    #[test]
    fn prompt_matching_prefers_login_over_shell() {
        let config = ControlClientConfig {
            login_prompt: Some("login: ".to_string()),
            ..Default::default()
        };
        assert_eq!(prompt_match("host login: ", &config), Some(PromptKind::Login));
        assert_eq!(prompt_match("> ", &config), Some(PromptKind::Shell));
        assert_eq!(prompt_match("partial", &config), None);
    }
}
