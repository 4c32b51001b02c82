//! Frame header codec and hop operations.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Hard cap on packets per frame (count is carried in one byte).
pub const MAX_PACKETS: usize = 255;

/// Structural decode/encode failures. A malformed frame is dropped whole;
/// no request state is created for its contents.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),

    #[error("header length {header_len} exceeds frame length {total}")]
    HeaderOverrun { header_len: usize, total: usize },

    #[error("packet count {0} out of range")]
    BadPacketCount(usize),

    #[error("hop list section malformed")]
    BadHopList,

    #[error("hop list entry is not UTF-8")]
    BadHopEncoding,

    #[error("offsets are not monotonic non-decreasing")]
    BadOffsets,

    #[error("last offset {last} exceeds payload length {payload}")]
    OffsetOverrun { last: u32, payload: usize },

    #[error("hop counter {counter} out of range for {hops} hops")]
    BadHopCounter { counter: usize, hops: usize },

    #[error("hop counter cannot move past the hop list")]
    HopExhausted,
}

/// The previous hop of a frame on the response path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousHop {
    /// The frame is about to re-enter the ingress node; its address is not
    /// carried in the hop list and must come from recorded request state.
    Ingress,
    /// A relay, and whether it is the first relay of the route.
    Relay { ip: String, is_first: bool },
}

/// Parsed frame header.
///
/// `hop_list` holds the remaining route from the first relay through the
/// terminal target; the ingress node is not listed. `offsets` are
/// cumulative payload boundaries with `offsets[0] == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub packet_ids: Vec<u32>,
    pub hop_list: Vec<String>,
    pub hop_counter: u8,
    pub offsets: Vec<u32>,
}

impl FrameHeader {
    /// Build a header for a fresh batch at the ingress.
    ///
    /// Offsets are derived from the per-packet payload sizes.
    pub fn new(
        packet_ids: Vec<u32>,
        hop_list: Vec<String>,
        sizes: &[usize],
    ) -> Result<Self, FrameError> {
        if packet_ids.is_empty() || packet_ids.len() > MAX_PACKETS {
            return Err(FrameError::BadPacketCount(packet_ids.len()));
        }
        if packet_ids.len() != sizes.len() {
            return Err(FrameError::BadOffsets);
        }
        let mut offsets = Vec::with_capacity(sizes.len() + 1);
        let mut total: u32 = 0;
        offsets.push(0);
        for &size in sizes {
            total += size as u32;
            offsets.push(total);
        }
        Ok(Self {
            packet_ids,
            hop_list,
            hop_counter: 0,
            offsets,
        })
    }

    pub fn packet_count(&self) -> usize {
        self.packet_ids.len()
    }

    /// Total payload length implied by the offsets.
    pub fn payload_len(&self) -> usize {
        *self.offsets.last().unwrap_or(&0) as usize
    }

    /// Serialize; returns the encoded bytes (the header length is embedded
    /// at bytes 2..4).
    pub fn pack(&self) -> Result<Vec<u8>, FrameError> {
        let n = self.packet_ids.len();
        if n == 0 || n > MAX_PACKETS {
            return Err(FrameError::BadPacketCount(n));
        }
        if self.offsets.len() != n + 1 {
            return Err(FrameError::BadOffsets);
        }
        if usize::from(self.hop_counter) > self.hop_list.len() {
            return Err(FrameError::BadHopCounter {
                counter: self.hop_counter.into(),
                hops: self.hop_list.len(),
            });
        }

        let hop_bytes: usize = self.hop_list.iter().map(|h| 2 + h.len()).sum();
        let header_len = 4 + 4 * n + hop_bytes + 4 * (n + 1);
        let mut buf = BytesMut::with_capacity(header_len);
        buf.put_u8(n as u8);
        buf.put_u8(self.hop_counter);
        buf.put_u16(header_len as u16);
        for id in &self.packet_ids {
            buf.put_u32(*id);
        }
        for hop in &self.hop_list {
            buf.put_u16(hop.len() as u16);
            buf.put_slice(hop.as_bytes());
        }
        for offset in &self.offsets {
            buf.put_u32(*offset);
        }
        Ok(buf.to_vec())
    }

    /// Header length field of an encoded frame, without a full decode.
    pub fn peek_header_len(data: &[u8]) -> Result<usize, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::TooShort(data.len()));
        }
        Ok(usize::from(u16::from_be_bytes([data[2], data[3]])))
    }

    /// Decode and validate a header from the front of `data`; the frame's
    /// payload is `data[header_len..]`.
    pub fn unpack(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < 4 {
            return Err(FrameError::TooShort(data.len()));
        }
        let n = usize::from(data[0]);
        let hop_counter = data[1];
        let header_len = usize::from(u16::from_be_bytes([data[2], data[3]]));
        if header_len > data.len() {
            return Err(FrameError::HeaderOverrun {
                header_len,
                total: data.len(),
            });
        }
        if n == 0 {
            return Err(FrameError::BadPacketCount(0));
        }

        let ids_end = 4 + 4 * n;
        let offsets_start = header_len
            .checked_sub(4 * (n + 1))
            .ok_or(FrameError::BadHopList)?;
        if ids_end > offsets_start {
            return Err(FrameError::BadHopList);
        }

        let mut packet_ids = Vec::with_capacity(n);
        for i in 0..n {
            let at = 4 + 4 * i;
            packet_ids.push(u32::from_be_bytes([
                data[at],
                data[at + 1],
                data[at + 2],
                data[at + 3],
            ]));
        }

        // The hop section spans [ids_end, offsets_start) and must be
        // consumed exactly.
        let mut hop_list = Vec::new();
        let mut at = ids_end;
        while at < offsets_start {
            if at + 2 > offsets_start {
                return Err(FrameError::BadHopList);
            }
            let len = usize::from(u16::from_be_bytes([data[at], data[at + 1]]));
            at += 2;
            if at + len > offsets_start {
                return Err(FrameError::BadHopList);
            }
            let hop = std::str::from_utf8(&data[at..at + len])
                .map_err(|_| FrameError::BadHopEncoding)?;
            hop_list.push(hop.to_string());
            at += len;
        }

        let mut offsets = Vec::with_capacity(n + 1);
        for i in 0..=n {
            let o = offsets_start + 4 * i;
            offsets.push(u32::from_be_bytes([
                data[o],
                data[o + 1],
                data[o + 2],
                data[o + 3],
            ]));
        }
        if offsets[0] != 0 || offsets.windows(2).any(|w| w[1] < w[0]) {
            return Err(FrameError::BadOffsets);
        }
        let payload = data.len() - header_len;
        let last = *offsets.last().expect("offsets are non-empty");
        if last as usize > payload {
            return Err(FrameError::OffsetOverrun { last, payload });
        }
        if usize::from(hop_counter) > hop_list.len() {
            return Err(FrameError::BadHopCounter {
                counter: hop_counter.into(),
                hops: hop_list.len(),
            });
        }

        Ok(Self {
            packet_ids,
            hop_list,
            hop_counter,
            offsets,
        })
    }

    /// Slice boundaries of each contained packet within the payload:
    /// packet `i` occupies `positions[i]..positions[i+1]`.
    pub fn request_positions(&self) -> Vec<usize> {
        self.offsets.iter().map(|&o| o as usize).collect()
    }

    /// The hop this frame travels to next, and whether that hop is the
    /// terminal one.
    pub fn next_hop(&self) -> Result<(&str, bool), FrameError> {
        let i = usize::from(self.hop_counter);
        let hop = self
            .hop_list
            .get(i)
            .ok_or(FrameError::BadHopCounter {
                counter: i,
                hops: self.hop_list.len(),
            })?;
        Ok((hop.as_str(), i == self.hop_list.len() - 1))
    }

    /// The hop a response frame should return to, after the counter has
    /// been decremented.
    pub fn previous_hop(&self) -> PreviousHop {
        match usize::from(self.hop_counter).checked_sub(1) {
            None => PreviousHop::Ingress,
            Some(i) => PreviousHop::Relay {
                ip: self.hop_list[i].clone(),
                is_first: i == 0,
            },
        }
    }

    /// Advance the counter on the request path.
    pub fn increment_hop(&mut self) -> Result<(), FrameError> {
        if usize::from(self.hop_counter) >= self.hop_list.len() {
            return Err(FrameError::HopExhausted);
        }
        self.hop_counter += 1;
        Ok(())
    }

    /// Rewind the counter on the response path.
    pub fn decrement_hop(&mut self) -> Result<(), FrameError> {
        if self.hop_counter == 0 {
            return Err(FrameError::HopExhausted);
        }
        self.hop_counter -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reference_header() -> FrameHeader {
        FrameHeader::new(
            vec![42, 7, 128],
            vec!["A".to_string(), "B".to_string(), "C".to_string()],
            &[10, 20, 5],
        )
        .unwrap()
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let header = reference_header();
        let bytes = header.pack().unwrap();
        // The frame as transmitted: header followed by 35 payload bytes.
        let mut frame = bytes.clone();
        frame.extend(std::iter::repeat(0xAB).take(35));

        let decoded = FrameHeader::unpack(&frame).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(FrameHeader::peek_header_len(&frame).unwrap(), bytes.len());
    }

    #[test]
    fn reference_positions_and_terminal_hop() {
        let mut header = reference_header();
        assert_eq!(header.request_positions(), vec![0, 10, 30, 35]);

        header.increment_hop().unwrap();
        header.increment_hop().unwrap();
        let (ip, is_last) = header.next_hop().unwrap();
        assert_eq!(ip, "C");
        assert!(is_last);
    }

    #[test]
    fn hop_walk_forward_and_back() {
        let mut header = reference_header();
        assert_eq!(header.next_hop().unwrap(), ("A", false));
        assert_eq!(header.previous_hop(), PreviousHop::Ingress);

        header.increment_hop().unwrap();
        assert_eq!(header.next_hop().unwrap(), ("B", false));
        assert_eq!(
            header.previous_hop(),
            PreviousHop::Relay {
                ip: "A".to_string(),
                is_first: true
            }
        );

        header.increment_hop().unwrap();
        header.decrement_hop().unwrap();
        header.decrement_hop().unwrap();
        assert_eq!(header.hop_counter, 0);
        assert!(header.decrement_hop().is_err());
    }

    #[test]
    fn counter_cannot_pass_the_hop_list() {
        let mut header = reference_header();
        for _ in 0..3 {
            header.increment_hop().unwrap();
        }
        assert_eq!(header.increment_hop(), Err(FrameError::HopExhausted));
        // A counter beyond the list is also rejected at decode time.
        let mut bytes = header.pack().unwrap();
        bytes[1] = 4;
        assert!(matches!(
            FrameHeader::unpack(&bytes),
            Err(FrameError::BadHopCounter { .. })
        ));
    }

    #[test]
    fn header_length_overrun_is_rejected() {
        let header = reference_header();
        let bytes = header.pack().unwrap();
        // Claim a header longer than the whole frame.
        let mut corrupt = bytes.clone();
        let bogus = (bytes.len() as u16 + 100).to_be_bytes();
        corrupt[2] = bogus[0];
        corrupt[3] = bogus[1];
        assert!(matches!(
            FrameHeader::unpack(&corrupt),
            Err(FrameError::HeaderOverrun { .. })
        ));
    }

    #[test]
    fn non_monotonic_offsets_are_rejected() {
        let header = reference_header();
        let mut bytes = header.pack().unwrap();
        let frame_len = bytes.len();
        // Swap the last two offsets (30 and 35) to break monotonicity.
        let last = frame_len - 4;
        let prev = frame_len - 8;
        for i in 0..4 {
            bytes.swap(last + i, prev + i);
        }
        bytes.extend(std::iter::repeat(0).take(35));
        assert_eq!(FrameHeader::unpack(&bytes), Err(FrameError::BadOffsets));
    }

    #[test]
    fn last_offset_beyond_payload_is_rejected() {
        let header = reference_header();
        let mut frame = header.pack().unwrap();
        // Only 10 payload bytes instead of the promised 35.
        frame.extend(std::iter::repeat(0).take(10));
        assert!(matches!(
            FrameHeader::unpack(&frame),
            Err(FrameError::OffsetOverrun { last: 35, .. })
        ));
    }

    #[test]
    fn truncated_and_empty_frames_are_rejected() {
        assert!(matches!(
            FrameHeader::unpack(&[1, 0]),
            Err(FrameError::TooShort(2))
        ));
        assert!(FrameHeader::new(vec![], vec![], &[]).is_err());
    }

    #[test]
    fn corrupt_hop_section_is_rejected() {
        let header = reference_header();
        let mut bytes = header.pack().unwrap();
        // First hop entry's length prefix now points past the section.
        let ids_end = 4 + 4 * 3;
        bytes[ids_end] = 0xFF;
        bytes[ids_end + 1] = 0xFF;
        assert_eq!(FrameHeader::unpack(&bytes), Err(FrameError::BadHopList));
    }

    #[test]
    fn empty_hop_list_packs_for_local_batches() {
        // Response frames between adjacent hops may carry the remaining
        // route only; an empty list is still structurally valid.
        let header = FrameHeader::new(vec![1], vec![], &[4]).unwrap();
        let mut frame = header.pack().unwrap();
        frame.extend_from_slice(&[1, 2, 3, 4]);
        let decoded = FrameHeader::unpack(&frame).unwrap();
        assert!(decoded.hop_list.is_empty());
        assert_eq!(decoded.request_positions(), vec![0, 4]);
    }

    #[test]
    fn single_packet_single_hop() {
        let mut header = FrameHeader::new(vec![9], vec!["origin".to_string()], &[12]).unwrap();
        let (ip, is_last) = header.next_hop().unwrap();
        assert_eq!(ip, "origin");
        assert!(is_last);
        header.increment_hop().unwrap();
        assert_eq!(
            header.previous_hop(),
            PreviousHop::Relay {
                ip: "origin".to_string(),
                is_first: true
            }
        );
    }
}
