//! meshway-frame — wire framing for batched overlay forwarding.
//!
//! One frame carries several logically independent HTTP requests (or
//! responses) between hops. The fixed-layout header records the contained
//! packet IDs, the hop list the batch travels along, the hop counter, and
//! cumulative payload offsets delimiting each packet:
//!
//! ```text
//! byte 0        packet count n
//! byte 1        hop counter
//! bytes 2..4    header length (u16, big-endian)
//! n × u32       packet IDs (big-endian)
//! m × entry     hop list: u16 length prefix + UTF-8 bytes each
//! (n+1) × u32   cumulative payload offsets, offsets[0] = 0
//! ```
//!
//! Decoding recovers the hop-list entry count from the header length; a
//! hop section that does not consume its extent exactly is malformed.

pub mod header;

pub use header::{FrameError, FrameHeader, PreviousHop};
