// src/core/commands/mod.rs

//! Builders for the commands the client itself issues: handshake, health
//! checks, tracking, pub/sub, and a few common key commands used by the
//! facade. Richer per-type command builders live outside the core and only
//! need [`Command`].

pub mod bitfield;

use crate::core::protocol::{Command, CommandFlags};
use crate::core::pubsub::SubscriptionKind;
use bytes::Bytes;

pub use bitfield::{BitField, BitFieldOp, BitOffset, BitType, OverflowBehavior};

pub fn ping() -> Command {
    Command::new("PING")
}

/// A `PING` issued by the idle sweep; it must not refresh the idle clock.
pub fn heartbeat() -> Command {
    Command::new("PING").with_flags(CommandFlags::WITHOUT_ACTIVE_TIME)
}

pub fn get(key: impl Into<Bytes>) -> Command {
    Command::new("GET")
        .key(key)
        .with_flags(CommandFlags::READONLY)
}

pub fn set(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Command {
    Command::new("SET").key(key).arg(value)
}

pub fn del<I, T>(keys: I) -> Command
where
    I: IntoIterator<Item = T>,
    T: Into<Bytes>,
{
    Command::new("DEL").keys(keys)
}

pub fn publish(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> Command {
    Command::new("PUBLISH").arg(channel).arg(message)
}

pub fn spublish(channel: impl Into<Bytes>, message: impl Into<Bytes>) -> Command {
    Command::new("SPUBLISH").arg(channel).arg(message)
}

pub fn select(database: u8) -> Command {
    Command::new("SELECT").arg_int(i64::from(database))
}

pub fn auth(user: Option<&str>, password: &str) -> Command {
    let cmd = Command::new("AUTH");
    let cmd = match user {
        Some(user) => cmd.arg(user.to_owned()),
        None => cmd,
    };
    cmd.arg(password.to_owned())
}

/// `HELLO 3 [AUTH user pass] [SETNAME name]`. A password without a user
/// authenticates as `default`.
pub fn hello(user: Option<&str>, password: Option<&str>, client_name: Option<&str>) -> Command {
    let mut cmd = Command::new("HELLO").arg("3");
    if let Some(password) = password {
        cmd = cmd
            .arg("AUTH")
            .arg(user.unwrap_or("default").to_owned())
            .arg(password.to_owned());
    }
    if let Some(name) = client_name {
        cmd = cmd.arg("SETNAME").arg(name.to_owned());
    }
    cmd
}

pub fn client_setname(name: &str) -> Command {
    Command::new("CLIENT").arg("SETNAME").arg(name.to_owned())
}

pub fn client_id() -> Command {
    Command::new("CLIENT").arg("ID")
}

/// `CLIENT TRACKING ON REDIRECT <id> [BCAST] [PREFIX p ...]`.
pub fn client_tracking(redirect: u64, broadcast: bool, prefixes: &[Bytes]) -> Command {
    let mut cmd = Command::new("CLIENT")
        .arg("TRACKING")
        .arg("ON")
        .arg("REDIRECT")
        .arg(redirect.to_string());
    if broadcast {
        cmd = cmd.arg("BCAST");
    }
    for prefix in prefixes {
        cmd = cmd.arg("PREFIX").arg(prefix.clone());
    }
    cmd
}

/// Builds `SUBSCRIBE`, `PSUBSCRIBE` or `SSUBSCRIBE`. Acknowledgements arrive
/// as push messages, so no direct reply is expected.
pub fn subscribe<I, T>(kind: SubscriptionKind, channels: I) -> Command
where
    I: IntoIterator<Item = T>,
    T: Into<Bytes>,
{
    Command::new(kind.subscribe_command())
        .args(channels)
        .with_flags(CommandFlags::NO_REPLY | CommandFlags::PUBSUB)
}

pub fn unsubscribe<I, T>(kind: SubscriptionKind, channels: I) -> Command
where
    I: IntoIterator<Item = T>,
    T: Into<Bytes>,
{
    Command::new(kind.unsubscribe_command())
        .args(channels)
        .with_flags(CommandFlags::NO_REPLY | CommandFlags::PUBSUB)
}
