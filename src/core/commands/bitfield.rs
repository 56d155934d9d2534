// src/core/commands/bitfield.rs

//! A validating builder for `BITFIELD` / `BITFIELD_RO`.
//!
//! Sub-commands are tagged variants; ordering rules (an `OVERFLOW` only
//! affects the `SET`/`INCRBY` that follows it) are checked when the builder is
//! turned into a [`Command`].

use crate::core::ClientError;
use crate::core::protocol::{Command, CommandFlags};
use bytes::Bytes;
use std::fmt;

/// Represents the integer type for a BITFIELD operation (e.g., i8, u16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitType {
    Signed(u8),
    Unsigned(u8),
}

impl BitType {
    fn validate(self) -> Result<Self, ClientError> {
        match self {
            BitType::Signed(bits) if (1..=64).contains(&bits) => Ok(self),
            BitType::Unsigned(bits) if (1..=63).contains(&bits) => Ok(self),
            BitType::Signed(_) => Err(ClientError::InvalidConfig(
                "signed bitfield types must be between i1 and i64".into(),
            )),
            BitType::Unsigned(_) => Err(ClientError::InvalidConfig(
                "unsigned bitfield types must be between u1 and u63".into(),
            )),
        }
    }
}

impl fmt::Display for BitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitType::Signed(bits) => write!(f, "i{bits}"),
            BitType::Unsigned(bits) => write!(f, "u{bits}"),
        }
    }
}

/// A bit offset: either absolute, or a multiple of the type width (`#n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitOffset {
    Absolute(u64),
    Scaled(u64),
}

impl fmt::Display for BitOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BitOffset::Absolute(n) => write!(f, "{n}"),
            BitOffset::Scaled(n) => write!(f, "#{n}"),
        }
    }
}

/// Defines the overflow handling strategy for INCRBY operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowBehavior {
    Wrap,
    Sat,
    Fail,
}

impl OverflowBehavior {
    fn as_str(self) -> &'static str {
        match self {
            OverflowBehavior::Wrap => "WRAP",
            OverflowBehavior::Sat => "SAT",
            OverflowBehavior::Fail => "FAIL",
        }
    }
}

/// Represents a specific BITFIELD sub-operation (GET, SET, INCRBY, OVERFLOW).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitFieldOp {
    Get(BitType, BitOffset),
    Set(BitType, BitOffset, i64),
    IncrBy(BitType, BitOffset, i64),
    Overflow(OverflowBehavior),
}

#[derive(Debug, Clone)]
pub struct BitField {
    key: Bytes,
    operations: Vec<BitFieldOp>,
}

impl BitField {
    pub fn new(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            operations: Vec::new(),
        }
    }

    pub fn get(mut self, ty: BitType, offset: BitOffset) -> Self {
        self.operations.push(BitFieldOp::Get(ty, offset));
        self
    }

    pub fn set(mut self, ty: BitType, offset: BitOffset, value: i64) -> Self {
        self.operations.push(BitFieldOp::Set(ty, offset, value));
        self
    }

    pub fn incr_by(mut self, ty: BitType, offset: BitOffset, increment: i64) -> Self {
        self.operations
            .push(BitFieldOp::IncrBy(ty, offset, increment));
        self
    }

    pub fn overflow(mut self, behavior: OverflowBehavior) -> Self {
        self.operations.push(BitFieldOp::Overflow(behavior));
        self
    }

    /// Returns true if every operation is a `GET`.
    pub fn is_read_only(&self) -> bool {
        self.operations
            .iter()
            .all(|op| matches!(op, BitFieldOp::Get(..)))
    }

    /// Validates the operation sequence and builds the command. Read-only
    /// sequences use `BITFIELD_RO`, which may be served by a replica and cached.
    pub fn into_command(self) -> Result<Command, ClientError> {
        if self.operations.is_empty() {
            return Err(ClientError::InvalidConfig(
                "BITFIELD requires at least one operation".into(),
            ));
        }

        let read_only = self.is_read_only();
        let mut cmd = if read_only {
            Command::new("BITFIELD_RO")
                .key(self.key)
                .with_flags(CommandFlags::READONLY)
        } else {
            Command::new("BITFIELD").key(self.key)
        };

        let mut pending_overflow = false;
        for op in self.operations {
            match op {
                BitFieldOp::Get(ty, offset) => {
                    let ty = ty.validate()?;
                    cmd = cmd.arg("GET").arg(ty.to_string()).arg(offset.to_string());
                }
                BitFieldOp::Set(ty, offset, value) => {
                    let ty = ty.validate()?;
                    pending_overflow = false;
                    cmd = cmd
                        .arg("SET")
                        .arg(ty.to_string())
                        .arg(offset.to_string())
                        .arg_int(value);
                }
                BitFieldOp::IncrBy(ty, offset, increment) => {
                    let ty = ty.validate()?;
                    pending_overflow = false;
                    cmd = cmd
                        .arg("INCRBY")
                        .arg(ty.to_string())
                        .arg(offset.to_string())
                        .arg_int(increment);
                }
                BitFieldOp::Overflow(behavior) => {
                    pending_overflow = true;
                    cmd = cmd.arg("OVERFLOW").arg(behavior.as_str());
                }
            }
        }

        if pending_overflow {
            return Err(ClientError::InvalidConfig(
                "OVERFLOW must be followed by SET or INCRBY".into(),
            ));
        }
        Ok(cmd)
    }
}
