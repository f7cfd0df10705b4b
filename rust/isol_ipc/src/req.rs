// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fmt;

/// Bytes per encoded block in the shared region.
pub const BLOCK_BYTES: usize = 8;
/// Decoded payload bytes carried by one block.
pub const BLOCK_PAYLOAD: usize = 7;
/// Request header: one type byte plus a little-endian u32 total length
/// (header included). The header occupies the first five payload
/// positions of the first block, leaving two for payload.
pub const HEADER_BYTES: usize = 5;

/// Request types exchanged between the manager and the workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ReqType {
    None = 0,
    Init,
    StartReady,
    StartLaunch,
    StartLaunchDone,
    StartLaunchFailure,
    StartConfirmed,
    Terminate,
    ExitIsolation,
    Exiting,
    LeaveIsolation,
    OkLeaveIsolation,
    Ping,
    Pong,
    Cmd,
    Print,
}

impl ReqType {
    /// Decode a wire type byte. Codes outside the closed set collapse to
    /// `None`, which the request handlers report as invalid.
    pub fn from_u8(v: u8) -> ReqType {
        match v {
            1 => ReqType::Init,
            2 => ReqType::StartReady,
            3 => ReqType::StartLaunch,
            4 => ReqType::StartLaunchDone,
            5 => ReqType::StartLaunchFailure,
            6 => ReqType::StartConfirmed,
            7 => ReqType::Terminate,
            8 => ReqType::ExitIsolation,
            9 => ReqType::Exiting,
            10 => ReqType::LeaveIsolation,
            11 => ReqType::OkLeaveIsolation,
            12 => ReqType::Ping,
            13 => ReqType::Pong,
            14 => ReqType::Cmd,
            15 => ReqType::Print,
            _ => ReqType::None,
        }
    }
}

impl fmt::Display for ReqType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReqType::None => "NONE",
            ReqType::Init => "INIT",
            ReqType::StartReady => "START_READY",
            ReqType::StartLaunch => "START_LAUNCH",
            ReqType::StartLaunchDone => "START_LAUNCH_DONE",
            ReqType::StartLaunchFailure => "START_LAUNCH_FAILURE",
            ReqType::StartConfirmed => "START_CONFIRMED",
            ReqType::Terminate => "TERMINATE",
            ReqType::ExitIsolation => "EXIT_ISOLATION",
            ReqType::Exiting => "EXITING",
            ReqType::LeaveIsolation => "LEAVE_ISOLATION",
            ReqType::OkLeaveIsolation => "OK_LEAVE_ISOLATION",
            ReqType::Ping => "PING",
            ReqType::Pong => "PONG",
            ReqType::Cmd => "CMD",
            ReqType::Print => "PRINT",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes_round_trip() {
        for v in 0..=15u8 {
            let ty = ReqType::from_u8(v);
            assert_eq!(ty as u8, v);
        }
        assert_eq!(ReqType::from_u8(200), ReqType::None);
    }
}
