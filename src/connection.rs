//! Per-client connection handling.
//!
//! Each TCP connection gets a reader task (this module) and a writer task
//! draining the session's outbound queue. The first line received is the
//! handshake username; after that every line is parsed and dispatched
//! against the shared state. All exit paths (explicit `/exit`, EOF, read or
//! write errors, oversized lines) converge on the logoff cascade.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::command::{self, Command};
use crate::state::{self, JoinOutcome, LeaveOutcome, RenameOutcome, SessionId, State};

/// Longest accepted input line in bytes, terminator included. Anything
/// longer is a protocol violation and drops the connection.
pub const MAX_LINE_LEN: usize = 512;

/// One bounded read from the client.
enum LineRead {
    Line(String),
    Eof,
    /// The cap was hit before a terminator arrived, or the terminated line
    /// exceeds the cap.
    TooLong,
}

/// Read one line without ever buffering more than the cap. The read itself
/// is limited, so a peer streaming bytes with no terminator is still caught
/// at the cap.
async fn read_capped_line<R>(reader: &mut BufReader<R>) -> std::io::Result<LineRead>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_LINE_LEN as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(LineRead::Eof);
    }
    if n > MAX_LINE_LEN {
        return Ok(LineRead::TooLong);
    }
    match String::from_utf8(buf) {
        Ok(line) => Ok(LineRead::Line(line)),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "line is not valid UTF-8",
        )),
    }
}

pub async fn handle(stream: TcpStream, addr: SocketAddr, state: Arc<Mutex<State>>) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let id = SessionId(COUNTER.fetch_add(1, Ordering::Relaxed));
    tracing::info!(%id, %addr, "new connection");

    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    // Queue of lines headed to this client. The session owns the sender;
    // dropping it (in the logoff cascade) winds the writer down.
    let (tx, mut rx) = mpsc::channel::<String>(state::OUTBOUND_QUEUE);
    let write_handle = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                tracing::debug!("write error: {e}");
                break;
            }
        }
    });

    // Handshake: the first line from a fresh connection is the username.
    let username = match read_capped_line(&mut reader).await? {
        LineRead::Line(line) => line.trim().to_string(),
        LineRead::Eof | LineRead::TooLong => {
            drop(tx);
            let _ = write_handle.await;
            return Ok(());
        }
    };

    let admitted = {
        let mut guard = state.lock().unwrap();
        if !state::is_valid_username(&username) {
            let _ = tx.try_send("Invalid username\r\n".to_string());
            false
        } else if !guard.register(id, addr, &username, tx.clone()) {
            let _ = tx.try_send("Username already in use\r\n".to_string());
            false
        } else {
            guard.deliver(id, "Username authenticated!\r\n".to_string());
            guard.deliver(id, "Welcome to Internet Relay Chat!!\r\n".to_string());
            guard.deliver(id, "type /help for list of commands\r\n".to_string());
            true
        }
    };
    drop(tx);
    if !admitted {
        tracing::info!(%id, %addr, %username, "handshake rejected");
        // Let the rejection flush before the socket closes.
        let _ = write_handle.await;
        return Ok(());
    }

    read_loop(&mut reader, id, &state).await;

    {
        let mut guard = state.lock().unwrap();
        guard.logoff(id);
        guard.reap_defunct();
    }
    let _ = write_handle.await;
    tracing::info!(%id, "connection closed");
    Ok(())
}

async fn read_loop<R>(reader: &mut BufReader<R>, id: SessionId, state: &Arc<Mutex<State>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let line = match read_capped_line(reader).await {
            Ok(LineRead::Line(line)) => line,
            Ok(LineRead::Eof) => return,
            Ok(LineRead::TooLong) => {
                tracing::warn!(%id, "oversized line, dropping connection");
                return;
            }
            Err(e) => {
                tracing::debug!(%id, "read error: {e}");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let mut guard = state.lock().unwrap();
        let keep_going = dispatch(&mut guard, id, &line);
        guard.reap_defunct();
        let alive = guard.session(id).is_some();
        drop(guard);
        if !keep_going || !alive {
            return;
        }
    }
}

/// Route one line. Returns false when the session asked to log off.
/// Surrounding whitespace is stripped before classification, so indented
/// commands stay commands.
fn dispatch(state: &mut State, id: SessionId, line: &str) -> bool {
    let line = line.trim();
    match Command::parse(line) {
        Command::Chat(text) => chat(state, id, text),
        Command::Msg { target, text } => private_message(state, id, target, text),
        Command::Help(topic) => state.deliver(id, command::help_text(topic)),
        Command::Who(None) => who_all(state, id),
        Command::Who(Some(channel)) => who_channel(state, id, channel),
        Command::List => list_channels(state, id),
        Command::Join(channel) => join(state, id, channel),
        Command::Leave(channel) => leave(state, id, channel),
        Command::Current(channel) => switch_current(state, id, channel),
        Command::Nick(name) => nick(state, id, name),
        Command::Whois(username) => whois(state, id, username),
        Command::Exit => {
            state.logoff(id);
            return false;
        }
        Command::Invalid => state.deliver(id, "Invalid command\r\n".to_string()),
    }
    true
}

fn chat(state: &mut State, id: SessionId, text: &str) {
    let Some((username, has_channels)) = state
        .session(id)
        .map(|s| (s.username.clone(), !s.channels.is_empty()))
    else {
        return;
    };
    if !has_channels {
        state.deliver(id, "Must join channel to send a message\r\n".to_string());
        return;
    }
    if text.is_empty() {
        state.deliver(id, "Empty message, nothing has been sent\r\n".to_string());
        return;
    }
    state.broadcast(id, &format!("<{username}> {text}\r\n"));
}

fn private_message(state: &mut State, id: SessionId, target: &str, text: &str) {
    let Some(sender) = state.session(id).map(|s| s.username.clone()) else {
        return;
    };
    if target == sender {
        state.deliver(id, "Can not private message yourself!\r\n".to_string());
        return;
    }
    let Some(peer) = state.lookup(target) else {
        state.deliver(id, "No such user\r\n".to_string());
        return;
    };
    state.deliver(peer, format!("<private message from {sender}> {text}\r\n"));
}

fn who_all(state: &mut State, id: SessionId) {
    let mut users = state.usernames();
    users.sort();
    state.deliver(id, "Users currently connected to server\r\n".to_string());
    state.deliver(id, format!("{}\r\n", users.join(", ")));
}

fn who_channel(state: &mut State, id: SessionId, channel: &str) {
    if state.list_channels().is_empty() {
        state.deliver(id, "No channels currently on server\r\n".to_string());
        return;
    }
    match state.members_of(channel) {
        Some(mut members) => {
            members.sort();
            state.deliver(id, format!("Users in {channel}\r\n"));
            state.deliver(id, format!("{}\r\n", members.join(", ")));
        }
        None => state.deliver(id, format!("No channel named {channel}\r\n")),
    }
}

fn list_channels(state: &mut State, id: SessionId) {
    let names = state.list_channels();
    if names.is_empty() {
        state.deliver(id, "No channels currently on server\r\n".to_string());
        return;
    }
    let listing = names.join(", ");
    state.deliver(id, "List of channels on server\r\n".to_string());
    state.deliver(id, format!("{listing}\r\n"));
}

fn join(state: &mut State, id: SessionId, channel: &str) {
    match state.join(id, channel) {
        Some(JoinOutcome::Joined) | Some(JoinOutcome::AlreadyMember) => {
            state.deliver(id, format!("Joined {channel}\r\n"));
        }
        Some(JoinOutcome::LimitReached) => {
            state.deliver(id, "Channel limit reached\r\n".to_string());
        }
        Some(JoinOutcome::InvalidName) => {
            state.deliver(id, "Invalid channel name\r\n".to_string());
            state.deliver(id, "See /help join\r\n".to_string());
        }
        None => {}
    }
}

fn leave(state: &mut State, id: SessionId, channel: &str) {
    match state.leave(id, channel) {
        Some(LeaveOutcome::Left { new_current, .. }) => {
            state.deliver(id, format!("You left {channel}\r\n"));
            if let Some(current) = new_current {
                state.deliver(id, format!("Current channel is now {current}\r\n"));
            }
        }
        Some(LeaveOutcome::NotMember) => {
            state.deliver(id, "Not in channel, must be in a channel to leave\r\n".to_string());
        }
        None => {}
    }
}

fn switch_current(state: &mut State, id: SessionId, channel: &str) {
    match state.switch_current(id, channel) {
        Some(true) => state.deliver(id, format!("Current channel is now {channel}\r\n")),
        Some(false) => {
            state.deliver(id, format!("Currently not in {channel}, must be in channel\r\n"));
        }
        None => {}
    }
}

fn nick(state: &mut State, id: SessionId, name: Option<&str>) {
    let Some(current) = state.session(id).map(|s| s.username.clone()) else {
        return;
    };
    let Some(name) = name else {
        state.deliver(id, format!("Current username: {current}\r\n"));
        return;
    };
    if !state::is_valid_username(name) {
        state.deliver(id, "Invalid username\r\n".to_string());
        return;
    }
    match state.rename(id, name) {
        Some(RenameOutcome::Renamed { .. }) => {
            state.deliver(id, format!("Now known as {name}\r\n"));
        }
        Some(RenameOutcome::Taken) => {
            state.deliver(id, "Username already in use\r\n".to_string());
        }
        Some(RenameOutcome::Unchanged) => {
            state.deliver(id, "Thats already your username\r\n".to_string());
        }
        None => {}
    }
}

fn whois(state: &mut State, id: SessionId, username: &str) {
    let Some(peer) = state.lookup(username) else {
        state.deliver(id, format!("{username} not currently connected to server\r\n"));
        return;
    };
    let Some((addr, channels)) = state.session(peer).map(|s| (s.addr, s.channels.clone())) else {
        return;
    };
    state.deliver(id, format!("User: {username} [{addr}]\r\n"));
    if channels.is_empty() {
        state.deliver(id, format!("{username} is currently not in any channels\r\n"));
    } else {
        state.deliver(id, format!("Channels: {}\r\n", channels.join(",")));
    }
}
