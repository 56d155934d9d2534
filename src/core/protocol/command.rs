// src/core/protocol/command.rs

//! The client-side representation of a command: an ordered argument list in
//! which every argument remembers whether it names a key, plus behavioral flags.

use bitflags::bitflags;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

bitflags! {
    /// Flags that describe how a command is dispatched and how its reply is handled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
    pub struct CommandFlags: u32 {
        /// The command only reads data; it may go to a replica and be cached.
        const READONLY             = 1 << 0;
        /// The server sends no direct reply (e.g. `SUBSCRIBE` acks arrive as pushes).
        const NO_REPLY             = 1 << 1;
        /// The command does not count as activity for idle bookkeeping.
        const WITHOUT_ACTIVE_TIME  = 1 << 2;
        /// A command related to the Pub/Sub system.
        const PUBSUB               = 1 << 3;
    }
}

/// A single command argument.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandArg {
    pub value: Bytes,
    pub is_key: bool,
}

/// A command ready to be written to a connection.
///
/// The key prefix configured on the client is never stored here; it is added
/// to key arguments while the command is serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<CommandArg>,
    flags: CommandFlags,
}

impl Command {
    pub fn new(name: impl Into<Bytes>) -> Self {
        Self {
            args: vec![CommandArg {
                value: name.into(),
                is_key: false,
            }],
            flags: CommandFlags::empty(),
        }
    }

    pub fn arg(mut self, value: impl Into<Bytes>) -> Self {
        self.args.push(CommandArg {
            value: value.into(),
            is_key: false,
        });
        self
    }

    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        self.args.push(CommandArg {
            value: key.into(),
            is_key: true,
        });
        self
    }

    pub fn args<I, T>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        for value in values {
            self = self.arg(value);
        }
        self
    }

    pub fn keys<I, T>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        for key in keys {
            self = self.key(key);
        }
        self
    }

    pub fn arg_int(self, value: i64) -> Self {
        let s = itoa::Buffer::new().format(value).to_owned();
        self.arg(s)
    }

    pub fn arg_float(self, value: f64) -> Self {
        let s = ryu::Buffer::new().format(value).to_owned();
        self.arg(s)
    }

    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn flags(&self) -> CommandFlags {
        self.flags
    }

    pub fn has_flag(&self, flag: CommandFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Returns true unless the command is flagged `NO_REPLY`.
    pub fn expects_reply(&self) -> bool {
        !self.flags.contains(CommandFlags::NO_REPLY)
    }

    /// The command name as written by the caller.
    pub fn name(&self) -> &[u8] {
        self.args.first().map_or(&[][..], |arg| &arg.value[..])
    }

    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name()).to_ascii_uppercase()
    }

    /// Number of arguments, including the command name.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    pub fn arguments(&self) -> &[CommandArg] {
        &self.args
    }

    /// Iterates over the raw (unprefixed) key arguments.
    pub fn keys_iter(&self) -> impl Iterator<Item = &Bytes> {
        self.args.iter().filter(|a| a.is_key).map(|a| &a.value)
    }

    pub fn has_keys(&self) -> bool {
        self.args.iter().any(|a| a.is_key)
    }

    /// Returns the keys as they appear on the wire, with `prefix` prepended.
    pub fn prefixed_keys(&self, prefix: Option<&[u8]>) -> Vec<Bytes> {
        self.keys_iter()
            .map(|k| match prefix {
                Some(p) if !p.is_empty() => {
                    let mut buf = BytesMut::with_capacity(p.len() + k.len());
                    buf.extend_from_slice(p);
                    buf.extend_from_slice(k);
                    buf.freeze()
                }
                _ => k.clone(),
            })
            .collect()
    }

    /// Serializes the command as a RESP array of bulk strings, prefixing keys.
    pub fn write_to(&self, prefix: Option<&[u8]>, dst: &mut BytesMut) {
        let prefix = prefix.filter(|p| !p.is_empty());
        let mut itoa_buf = itoa::Buffer::new();

        dst.put_u8(b'*');
        dst.extend_from_slice(itoa_buf.format(self.args.len()).as_bytes());
        dst.extend_from_slice(b"\r\n");
        for arg in &self.args {
            let key_prefix = if arg.is_key { prefix } else { None };
            let len = arg.value.len() + key_prefix.map_or(0, <[u8]>::len);
            dst.put_u8(b'$');
            dst.extend_from_slice(itoa_buf.format(len).as_bytes());
            dst.extend_from_slice(b"\r\n");
            if let Some(p) = key_prefix {
                dst.extend_from_slice(p);
            }
            dst.extend_from_slice(&arg.value);
            dst.extend_from_slice(b"\r\n");
        }
    }

    /// Convenience wrapper around [`Command::write_to`].
    pub fn to_bytes(&self, prefix: Option<&[u8]>) -> Bytes {
        let mut buf = BytesMut::with_capacity(16 * self.args.len());
        self.write_to(prefix, &mut buf);
        buf.freeze()
    }
}

const DISPLAY_ARG_LIMIT: usize = 64;

impl fmt::Display for Command {
    /// Renders the command for error messages; long arguments are truncated.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.value.len() > DISPLAY_ARG_LIMIT {
                let head = String::from_utf8_lossy(&arg.value[..DISPLAY_ARG_LIMIT]);
                write!(f, "{head}...")?;
            } else {
                f.write_str(&String::from_utf8_lossy(&arg.value))?;
            }
        }
        Ok(())
    }
}
