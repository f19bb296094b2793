//! Shared server state: session registry, channel directory and message routing.
//!
//! All of it lives in one [`State`] value behind a single mutex. Session and
//! channel invariants span both halves (a channel exists exactly while some
//! session lists it), so they are mutated together, never through separate
//! stores. Channel membership is derived from the sessions; the directory
//! only keeps the first-creation ordering for `/list`.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use rand::Rng;
use tokio::sync::mpsc;

/// Most channels a single session may hold at once.
pub const MAX_CHANNELS_PER_USER: usize = 10;

/// Username length cap, carried over from the legacy client boundary and
/// now enforced on the server.
pub const MAX_USERNAME_LEN: usize = 9;

/// Outbound queue depth per client. A peer that falls this far behind is
/// treated as disconnected.
pub const OUTBOUND_QUEUE: usize = 64;

/// Channel names must start with this marker.
pub const CHANNEL_MARKER: char = '#';

pub fn is_valid_channel_name(name: &str) -> bool {
    name.starts_with(CHANNEL_MARKER) && !name.contains(char::is_whitespace)
}

pub fn is_valid_username(name: &str) -> bool {
    !name.is_empty() && name.len() <= MAX_USERNAME_LEN && !name.contains(char::is_whitespace)
}

/// Opaque per-connection identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// One authenticated connection.
#[derive(Debug)]
pub struct Session {
    pub username: String,
    pub addr: SocketAddr,
    /// Joined channels in join order. No duplicates.
    pub channels: Vec<String>,
    /// Invariant: `Some(c)` implies `channels` contains `c`.
    pub current: Option<String>,
    outbound: mpsc::Sender<String>,
}

/// Picks which remaining joined channel becomes current after the session
/// leaves its current one. Injectable so tests can be deterministic.
pub trait ReassignPolicy: Send {
    /// Returns an index into `remaining`, which is never empty.
    fn pick(&mut self, remaining: &[String]) -> usize;
}

/// Production policy: uniform random choice, matching the historical
/// behavior of the server.
pub struct RandomReassign;

impl ReassignPolicy for RandomReassign {
    fn pick(&mut self, remaining: &[String]) -> usize {
        rand::thread_rng().gen_range(0..remaining.len())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    /// Already a member; the channel just became current again.
    AlreadyMember,
    LimitReached,
    InvalidName,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left {
        /// Channel promoted to current, when the left one was current and
        /// others remain.
        new_current: Option<String>,
        /// True when the last member left and the channel was deleted.
        channel_removed: bool,
    },
    NotMember,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RenameOutcome {
    Renamed { old: String },
    Taken,
    /// The requested name is already the session's own.
    Unchanged,
}

/// Registry + directory + routing engine, owned by one mutex.
pub struct State {
    sessions: HashMap<SessionId, Session>,
    /// Unique-username set: name -> session.
    users: HashMap<String, SessionId>,
    /// Directory listing in first-creation order.
    channel_order: Vec<String>,
    reassign: Box<dyn ReassignPolicy>,
    /// Peers whose outbound queue failed mid-fan-out; reaped into the
    /// logoff cascade once the current operation completes.
    defunct: Vec<SessionId>,
}

impl State {
    pub fn new(reassign: Box<dyn ReassignPolicy>) -> Self {
        Self {
            sessions: HashMap::new(),
            users: HashMap::new(),
            channel_order: Vec::new(),
            reassign,
            defunct: Vec::new(),
        }
    }

    // ── Session registry ────────────────────────────────────────────

    /// Admit a new session. Returns false when the username is taken; the
    /// pending session never becomes visible in that case.
    pub fn register(
        &mut self,
        id: SessionId,
        addr: SocketAddr,
        username: &str,
        outbound: mpsc::Sender<String>,
    ) -> bool {
        if self.users.contains_key(username) {
            return false;
        }
        self.users.insert(username.to_string(), id);
        self.sessions.insert(
            id,
            Session {
                username: username.to_string(),
                addr,
                channels: Vec::new(),
                current: None,
                outbound,
            },
        );
        tracing::info!(%id, %username, %addr, "client registered");
        true
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn lookup(&self, username: &str) -> Option<SessionId> {
        self.users.get(username).copied()
    }

    pub fn usernames(&self) -> Vec<String> {
        self.users.keys().cloned().collect()
    }

    pub fn rename(&mut self, id: SessionId, new: &str) -> Option<RenameOutcome> {
        let old = self.sessions.get(&id)?.username.clone();
        if new == old {
            return Some(RenameOutcome::Unchanged);
        }
        if self.users.contains_key(new) {
            return Some(RenameOutcome::Taken);
        }
        self.users.remove(&old);
        self.users.insert(new.to_string(), id);
        if let Some(session) = self.sessions.get_mut(&id) {
            session.username = new.to_string();
        }
        tracing::info!(%id, %old, %new, "renamed");
        let line = format!("{old} is now known as {new}\r\n");
        self.broadcast(id, &line);
        Some(RenameOutcome::Renamed { old })
    }

    // ── Channel directory ───────────────────────────────────────────

    /// Channel names in first-creation order.
    pub fn list_channels(&self) -> &[String] {
        &self.channel_order
    }

    /// Usernames of the channel's members, or None when no such channel
    /// exists. An existing channel always has at least one member.
    pub fn members_of(&self, channel: &str) -> Option<Vec<String>> {
        if !self.channel_order.iter().any(|c| c == channel) {
            return None;
        }
        Some(
            self.sessions
                .values()
                .filter(|s| s.channels.iter().any(|c| c == channel))
                .map(|s| s.username.clone())
                .collect(),
        )
    }

    pub fn join(&mut self, id: SessionId, channel: &str) -> Option<JoinOutcome> {
        let session = self.sessions.get(&id)?;
        // Limit applies regardless of whether the channel exists or is
        // already held.
        if session.channels.len() >= MAX_CHANNELS_PER_USER {
            return Some(JoinOutcome::LimitReached);
        }
        if session.channels.iter().any(|c| c == channel) {
            if let Some(session) = self.sessions.get_mut(&id) {
                session.current = Some(channel.to_string());
            }
            return Some(JoinOutcome::AlreadyMember);
        }
        let exists = self.channel_order.iter().any(|c| c == channel);
        if !exists && !is_valid_channel_name(channel) {
            return Some(JoinOutcome::InvalidName);
        }

        // Arrival notice goes to the members present before the join.
        let line = format!("{} joined {channel}\r\n", session.username);
        self.notify_channel(channel, Some(id), &line);

        if let Some(session) = self.sessions.get_mut(&id) {
            session.channels.push(channel.to_string());
            session.current = Some(channel.to_string());
        }
        if !exists {
            self.channel_order.push(channel.to_string());
            tracing::info!(%id, %channel, "channel created");
        }
        Some(JoinOutcome::Joined)
    }

    pub fn leave(&mut self, id: SessionId, channel: &str) -> Option<LeaveOutcome> {
        let session = self.sessions.get(&id)?;
        if !session.channels.iter().any(|c| c == channel) {
            return Some(LeaveOutcome::NotMember);
        }

        // Departure notice while still a member, so the leaver sees it too.
        let line = format!("{} left {channel}\r\n", session.username);
        self.notify_channel(channel, None, &line);

        let mut was_current = false;
        let remaining = {
            let session = self.sessions.get_mut(&id)?;
            session.channels.retain(|c| c != channel);
            if session.current.as_deref() == Some(channel) {
                session.current = None;
                was_current = true;
            }
            session.channels.clone()
        };

        let mut new_current = None;
        if was_current && !remaining.is_empty() {
            let idx = self.reassign.pick(&remaining).min(remaining.len() - 1);
            let chosen = remaining[idx].clone();
            if let Some(session) = self.sessions.get_mut(&id) {
                session.current = Some(chosen.clone());
            }
            new_current = Some(chosen);
        }

        let orphaned = !self
            .sessions
            .values()
            .any(|s| s.channels.iter().any(|c| c == channel));
        if orphaned {
            self.channel_order.retain(|c| c != channel);
            tracing::info!(%channel, "channel removed");
        }
        Some(LeaveOutcome::Left {
            new_current,
            channel_removed: orphaned,
        })
    }

    /// Switch the current channel. Some(false) when not a member.
    pub fn switch_current(&mut self, id: SessionId, channel: &str) -> Option<bool> {
        let session = self.sessions.get_mut(&id)?;
        if !session.channels.iter().any(|c| c == channel) {
            return Some(false);
        }
        session.current = Some(channel.to_string());
        Some(true)
    }

    // ── Routing engine ──────────────────────────────────────────────

    /// Queue a line for one session. A full or closed queue marks the peer
    /// defunct; delivery to the others is never blocked by it.
    pub fn deliver(&mut self, id: SessionId, line: String) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        if session.outbound.try_send(line).is_err() {
            tracing::debug!(%id, "outbound queue unavailable, scheduling logoff");
            if !self.defunct.contains(&id) {
                self.defunct.push(id);
            }
        }
    }

    /// Fan a line out to every other session sharing the sender's current
    /// channel. Senders with no current channel reach no one.
    pub fn broadcast(&mut self, sender: SessionId, line: &str) {
        let Some(current) = self.sessions.get(&sender).and_then(|s| s.current.clone()) else {
            return;
        };
        let targets: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(id, s)| **id != sender && s.current.as_deref() == Some(current.as_str()))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.deliver(id, line.to_string());
        }
    }

    /// Deliver a notice to every member of a channel (membership, not
    /// current-channel, scoped).
    pub fn notify_channel(&mut self, channel: &str, except: Option<SessionId>, line: &str) {
        let targets: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(id, s)| Some(**id) != except && s.channels.iter().any(|c| c == channel))
            .map(|(id, _)| *id)
            .collect();
        for id in targets {
            self.deliver(id, line.to_string());
        }
    }

    // ── Logoff cascade ──────────────────────────────────────────────

    /// Orderly teardown: announce, leave every channel in reverse-join
    /// order, free the username, drop the outbound transport, delete the
    /// session. Safe to call for an already-gone session.
    pub fn logoff(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        let username = session.username.clone();
        let channels = session.channels.clone();

        let line = format!("{username} has gone offline\r\n");
        self.broadcast(id, &line);

        for channel in channels.iter().rev() {
            self.leave(id, channel);
        }

        self.users.remove(&username);
        self.sessions.remove(&id);
        self.defunct.retain(|d| *d != id);
        tracing::info!(%id, %username, "session closed");
    }

    /// Run the logoff cascade for every peer whose delivery failed. Cascades
    /// may mark further peers defunct; the loop drains them all.
    pub fn reap_defunct(&mut self) {
        while let Some(id) = self.defunct.pop() {
            self.logoff(id);
        }
    }

    /// Process shutdown: cascade every active session.
    pub fn shutdown_all(&mut self) {
        let ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        for id in ids {
            self.logoff(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic policy: always promotes the first remaining channel.
    struct FirstReassign;

    impl ReassignPolicy for FirstReassign {
        fn pick(&mut self, _remaining: &[String]) -> usize {
            0
        }
    }

    fn state() -> State {
        State::new(Box::new(FirstReassign))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn connect(state: &mut State, id: u64, name: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        assert!(state.register(SessionId(id), addr(), name, tx));
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(line) = rx.try_recv() {
            out.push(line);
        }
        out
    }

    #[test]
    fn usernames_are_unique() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        let (tx, _rx) = mpsc::channel(OUTBOUND_QUEUE);
        assert!(!st.register(SessionId(2), addr(), "alice", tx));
        assert!(st.session(SessionId(2)).is_none());
        assert_eq!(st.lookup("alice"), Some(SessionId(1)));
    }

    #[test]
    fn join_creates_channel_and_sets_current() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        assert_eq!(st.join(SessionId(1), "#x"), Some(JoinOutcome::Joined));
        let s = st.session(SessionId(1)).unwrap();
        assert_eq!(s.current.as_deref(), Some("#x"));
        assert!(s.channels.iter().any(|c| c == "#x"));
        assert_eq!(st.list_channels(), ["#x".to_string()]);
    }

    #[test]
    fn join_rejects_invalid_new_names() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        assert_eq!(st.join(SessionId(1), "general"), Some(JoinOutcome::InvalidName));
        assert!(st.list_channels().is_empty());
    }

    #[test]
    fn join_limit_is_ten() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        for i in 0..MAX_CHANNELS_PER_USER {
            assert_eq!(
                st.join(SessionId(1), &format!("#c{i}")),
                Some(JoinOutcome::Joined)
            );
        }
        assert_eq!(st.join(SessionId(1), "#over"), Some(JoinOutcome::LimitReached));
        assert_eq!(st.session(SessionId(1)).unwrap().channels.len(), 10);
    }

    #[test]
    fn limit_applies_even_to_already_joined_channels() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        for i in 0..MAX_CHANNELS_PER_USER {
            st.join(SessionId(1), &format!("#c{i}"));
        }
        assert_eq!(st.join(SessionId(1), "#c0"), Some(JoinOutcome::LimitReached));
        assert_eq!(st.session(SessionId(1)).unwrap().channels.len(), 10);
    }

    #[test]
    fn rejoining_does_not_duplicate_membership() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        st.join(SessionId(1), "#x");
        st.join(SessionId(1), "#y");
        assert_eq!(st.join(SessionId(1), "#x"), Some(JoinOutcome::AlreadyMember));
        let s = st.session(SessionId(1)).unwrap();
        assert_eq!(s.channels, ["#x".to_string(), "#y".to_string()]);
        assert_eq!(s.current.as_deref(), Some("#x"));
    }

    #[test]
    fn current_is_always_a_joined_channel() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        st.join(SessionId(1), "#x");
        st.join(SessionId(1), "#y");
        st.leave(SessionId(1), "#y");
        let s = st.session(SessionId(1)).unwrap();
        let current = s.current.clone().unwrap();
        assert!(s.channels.contains(&current));
    }

    #[test]
    fn leaving_only_channel_clears_current_and_directory() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        st.join(SessionId(1), "#x");
        let outcome = st.leave(SessionId(1), "#x");
        assert_eq!(
            outcome,
            Some(LeaveOutcome::Left {
                new_current: None,
                channel_removed: true
            })
        );
        assert_eq!(st.session(SessionId(1)).unwrap().current, None);
        assert!(st.list_channels().is_empty());
    }

    #[test]
    fn leaving_current_promotes_a_remaining_channel() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        st.join(SessionId(1), "#x");
        st.join(SessionId(1), "#y");
        st.join(SessionId(1), "#z");
        // #z is current; FirstReassign promotes #x.
        let outcome = st.leave(SessionId(1), "#z");
        assert_eq!(
            outcome,
            Some(LeaveOutcome::Left {
                new_current: Some("#x".to_string()),
                channel_removed: true
            })
        );
        assert_eq!(st.session(SessionId(1)).unwrap().current.as_deref(), Some("#x"));
    }

    #[test]
    fn leaving_non_current_keeps_current() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        st.join(SessionId(1), "#x");
        st.join(SessionId(1), "#y");
        st.leave(SessionId(1), "#x");
        assert_eq!(st.session(SessionId(1)).unwrap().current.as_deref(), Some("#y"));
    }

    #[test]
    fn leave_requires_membership() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        assert_eq!(st.leave(SessionId(1), "#x"), Some(LeaveOutcome::NotMember));
    }

    #[test]
    fn directory_listing_matches_derived_membership() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        let _b = connect(&mut st, 2, "bob");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#x");
        st.join(SessionId(2), "#y");
        assert_eq!(st.list_channels(), ["#x".to_string(), "#y".to_string()]);

        // Channel survives while one member remains.
        st.leave(SessionId(1), "#x");
        assert_eq!(st.list_channels(), ["#x".to_string(), "#y".to_string()]);
        assert_eq!(st.members_of("#x"), Some(vec!["bob".to_string()]));

        st.leave(SessionId(2), "#x");
        assert_eq!(st.list_channels(), ["#y".to_string()]);
        assert_eq!(st.members_of("#x"), None);
    }

    #[test]
    fn broadcast_is_scoped_to_current_channel() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let mut b = connect(&mut st, 2, "bob");
        let mut c = connect(&mut st, 3, "carol");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#x");
        st.join(SessionId(3), "#y");
        drain(&mut a);
        drain(&mut b);
        drain(&mut c);

        st.broadcast(SessionId(1), "<alice> hi\r\n");
        assert_eq!(drain(&mut b), ["<alice> hi\r\n"]);
        assert!(drain(&mut c).is_empty());
        assert!(drain(&mut a).is_empty(), "sender must not hear itself");
    }

    #[test]
    fn session_without_current_channel_sends_and_hears_nothing() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let mut b = connect(&mut st, 2, "bob");
        st.join(SessionId(2), "#x");
        drain(&mut a);
        drain(&mut b);

        st.broadcast(SessionId(1), "<alice> hi\r\n");
        assert!(drain(&mut b).is_empty());

        st.broadcast(SessionId(2), "<bob> hi\r\n");
        assert!(drain(&mut a).is_empty());
    }

    #[test]
    fn leave_notice_reaches_every_member_including_leaver() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let mut b = connect(&mut st, 2, "bob");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#x");
        drain(&mut a);
        drain(&mut b);

        st.leave(SessionId(1), "#x");
        assert_eq!(drain(&mut a), ["alice left #x\r\n"]);
        assert_eq!(drain(&mut b), ["alice left #x\r\n"]);
    }

    #[test]
    fn rename_swaps_unique_name_and_notifies_peers() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let mut b = connect(&mut st, 2, "bob");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#x");
        drain(&mut a);
        drain(&mut b);

        assert_eq!(
            st.rename(SessionId(1), "alicia"),
            Some(RenameOutcome::Renamed {
                old: "alice".to_string()
            })
        );
        assert_eq!(drain(&mut b), ["alice is now known as alicia\r\n"]);
        assert_eq!(st.lookup("alice"), None);
        assert_eq!(st.lookup("alicia"), Some(SessionId(1)));

        // The freed name can be claimed again.
        let _c = connect(&mut st, 3, "alice");
    }

    #[test]
    fn rename_conflicts_and_noops_are_distinct() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        let _b = connect(&mut st, 2, "bob");
        assert_eq!(st.rename(SessionId(1), "bob"), Some(RenameOutcome::Taken));
        assert_eq!(st.rename(SessionId(1), "alice"), Some(RenameOutcome::Unchanged));
        assert_eq!(st.lookup("alice"), Some(SessionId(1)));
    }

    #[test]
    fn logoff_cascade_cleans_everything() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let mut b = connect(&mut st, 2, "bob");
        st.join(SessionId(1), "#x");
        st.join(SessionId(1), "#y");
        st.join(SessionId(2), "#x");
        drain(&mut a);
        drain(&mut b);

        st.logoff(SessionId(1));
        assert!(st.session(SessionId(1)).is_none());
        assert_eq!(st.lookup("alice"), None);
        // #y had no other member; #x keeps bob.
        assert_eq!(st.list_channels(), ["#x".to_string()]);

        let lines = drain(&mut b);
        assert!(lines.iter().any(|l| l.contains("alice left #x")));

        // Idempotent from any trigger site.
        st.logoff(SessionId(1));
        assert_eq!(st.usernames(), ["bob".to_string()]);
    }

    #[test]
    fn offline_notice_reaches_current_channel_peers() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let mut b = connect(&mut st, 2, "bob");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#x");
        drain(&mut a);
        drain(&mut b);

        st.logoff(SessionId(1));
        let lines = drain(&mut b);
        assert!(lines.iter().any(|l| l.contains("alice has gone offline")));
    }

    #[test]
    fn dead_peer_is_reaped_without_blocking_fanout() {
        let mut st = state();
        let mut a = connect(&mut st, 1, "alice");
        let b = connect(&mut st, 2, "bob");
        let mut c = connect(&mut st, 3, "carol");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#x");
        st.join(SessionId(3), "#x");
        drain(&mut a);
        drain(&mut c);
        drop(b); // bob's writer is gone

        st.broadcast(SessionId(1), "<alice> hi\r\n");
        // carol still got the message despite bob's failure
        assert!(drain(&mut c).contains(&"<alice> hi\r\n".to_string()));

        st.reap_defunct();
        assert!(st.session(SessionId(2)).is_none());
        assert_eq!(st.lookup("bob"), None);
        assert!(drain(&mut c).iter().any(|l| l.contains("bob has gone offline")));
    }

    #[test]
    fn shutdown_cascades_all_sessions() {
        let mut st = state();
        let _a = connect(&mut st, 1, "alice");
        let _b = connect(&mut st, 2, "bob");
        st.join(SessionId(1), "#x");
        st.join(SessionId(2), "#y");
        st.shutdown_all();
        assert!(st.usernames().is_empty());
        assert!(st.list_channels().is_empty());
    }

    #[test]
    fn name_validation_rules() {
        assert!(is_valid_username("billy"));
        assert!(!is_valid_username(""));
        assert!(!is_valid_username("nine_chars_plus"));
        assert!(!is_valid_username("a b"));
        assert!(is_valid_channel_name("#x"));
        assert!(!is_valid_channel_name("x"));
        assert!(!is_valid_channel_name("#a b"));
    }
}
