use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use crate::request::ModeKind;

/// Process creation flags (`dwCreationFlags`).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CreationFlags(pub u32);

impl CreationFlags {
    pub const NONE: CreationFlags = CreationFlags(0);
    pub const DEBUG_PROCESS: CreationFlags = CreationFlags(0x0000_0001);
    pub const DEBUG_ONLY_THIS_PROCESS: CreationFlags = CreationFlags(0x0000_0002);
    pub const SUSPENDED: CreationFlags = CreationFlags(0x0000_0004);
    pub const DETACHED: CreationFlags = CreationFlags(0x0000_0008);
    pub const NEW_CONSOLE: CreationFlags = CreationFlags(0x0000_0010);
    pub const NEW_PROCESS_GROUP: CreationFlags = CreationFlags(0x0000_0200);
    pub const UNICODE_ENVIRONMENT: CreationFlags = CreationFlags(0x0000_0400);
    pub const PROTECTED_PROCESS: CreationFlags = CreationFlags(0x0004_0000);
    pub const BREAKAWAY_FROM_JOB: CreationFlags = CreationFlags(0x0100_0000);
    pub const DEFAULT_ERROR_MODE: CreationFlags = CreationFlags(0x0400_0000);
    pub const NO_WINDOW: CreationFlags = CreationFlags(0x0800_0000);

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Checks if every bit of `other` is set in `self`.
    pub fn contains(self, other: CreationFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for CreationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        CreationFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for CreationFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for CreationFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CreationFlags({:#010x})", self.0)
    }
}

/// The flags actually handed to the native creation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveFlags {
    pub flags: CreationFlags,
    /// True when the requested flags were contradictory and dropped to zero.
    pub stripped: bool,
}

/// Computes the flags passed to the OS for `requested` under `mode`.
///
/// The unicode-environment flag is always added. `DETACHED` cannot be
/// combined with a new console, and the logon and token primitives always
/// create one; in that case every flag is dropped so the launch runs with
/// defaults instead of being refused by the OS. `CreateProcessAsUserW` is
/// always called with no flags.
pub fn effective_flags(requested: CreationFlags, mode: ModeKind) -> EffectiveFlags {
    let flags = requested | CreationFlags::UNICODE_ENVIRONMENT;

    if flags.contains(CreationFlags::DETACHED)
        && (flags.contains(CreationFlags::NEW_CONSOLE) || mode.implies_new_console())
    {
        return EffectiveFlags {
            flags: CreationFlags::NONE,
            stripped: true,
        };
    }

    if mode == ModeKind::LogonThenImpersonate {
        return EffectiveFlags {
            flags: CreationFlags::NONE,
            stripped: false,
        };
    }

    EffectiveFlags {
        flags,
        stripped: false,
    }
}
