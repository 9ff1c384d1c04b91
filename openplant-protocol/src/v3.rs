//! Constants of the v3 command path used by realtime and archive shortcuts.

/// Magic word framing login replies and heartbeat records.
pub const MAGIC: u32 = 0x1020_3040;

pub const CMD_SELECT: u32 = 110;
pub const CMD_UPDATE: u32 = 120;
pub const CMD_INSERT: u32 = 130;
pub const CMD_DELETE: u32 = 140;
pub const CMD_REPLACE: u32 = 150;

/// Realtime (dynamic) data.
pub const URL_DYNAMIC: u32 = 0x2300_0000;
/// Historical data.
pub const URL_ARCHIVE: u32 = 0x3000_0000;
/// Echo / heartbeat.
pub const URL_ECHO: u32 = 0x4600_0000;

pub const FLAG_WALL: u32 = 0x100;
pub const FLAG_MMI: u32 = 0x200;
pub const FLAG_SYNC: u32 = 0x400;
pub const FLAG_CTRL: u32 = 0x800;
pub const FLAG_FEEDBACK: u32 = 0x1000;
pub const FLAG_CACHE: u32 = 0x2000;
