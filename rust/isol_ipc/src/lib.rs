// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! # Shared-memory request channel
//!
//! A single-producer/single-consumer request queue over a shared byte
//! region, designed so the reader can run in kernel-quiescent isolated
//! mode: no kernel calls, no locks, no allocation on either path.
//!
//! The shared state is only the bytes. Every byte's low bit is an inline
//! "ready" marker, so no separate index has to be kept coherent between
//! the sides: 7 payload bytes are spread over the high bits of an 8-byte
//! block whose low bits the writer sets last and the reader clears after
//! copying out. A block fits one 64-bit word, so a fully-marked block is
//! observed atomically on any 64-bit-coherent machine.

mod region;
pub use region::area_name;
pub use region::SharedRegion;
pub use region::AREA_SIZE;

mod req;
pub use req::ReqType;
pub use req::BLOCK_BYTES;
pub use req::BLOCK_PAYLOAD;
pub use req::HEADER_BYTES;

mod ring;
pub use ring::ChannelError;
pub use ring::RingReader;
pub use ring::RingWriter;
