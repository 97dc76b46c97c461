/*
    fluxtap
    https://github.com/dbalsom/fluxtap

    Copyright 2024-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------

    src/protocol/dcd.rs

    The DCD link codec. DCD frames travel as 7-bit bodies: each wire byte
    carries bits 7..1 of a payload byte in its low seven bits, and the
    missing LSBs of a 7-byte group arrive bundled in a separate carrier byte.
    The two directions pack opposite ways — host frames lead each group with
    the carrier, device frames trail it — so the link is decoded by two
    direction decoders fed the same byte stream in lockstep.
*/

use crate::DCD_GROUP_LEN;

/// Sync byte opening every frame (and every post-holdoff resumption).
pub const SYNC_BYTE: u8 = 0xAA;

/// The outcome of feeding one byte to a direction decoder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FeedOutcome {
    /// Still mid-frame (or still waiting for one to start).
    Hopeful,
    /// The decoder is inert: unseeded, or already finished a frame and
    /// awaiting reset. When both direction decoders report this mid-burst,
    /// the transaction is desynchronized.
    GaveUp,
    /// A full `out_groups * 7`-byte payload was assembled. `valid` means the
    /// byte-sum checksum balanced and the first payload byte carried the
    /// direction's expected flag bit.
    Complete { valid: bool },
}

#[derive(Copy, Clone, Debug)]
pub struct FeedResult {
    /// The decoder (re)started on this byte: the first byte fed after a
    /// reset. The session loop records the byte's tell as the frame origin.
    pub synced:  bool,
    pub outcome: FeedOutcome,
}

fn byte_sum_balanced(data: &[u8]) -> bool {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)) == 0
}

#[derive(Debug)]
enum HostState {
    SeekingSync,
    ReadingOutGroups,
    ReadingInGroups,
    AwaitingCarrier,
    /// Carrier bits pending; consumed LSB-first, one per payload byte. The
    /// guard bit above them marks exhaustion (value reaches 0x01).
    ReadingPayload { carrier: u8 },
    /// Mid-frame holdoff: the group ended with the continuation flag clear,
    /// so the host re-syncs before the next carrier.
    Holdoff,
    Complete { valid: bool },
}

/// Decoder for host-to-device frames.
///
/// Frame layout: sync, `out_groups` header byte, `in_groups` header byte
/// (both low-7-bits, a zero value is re-read), then `out_groups` groups of a
/// carrier byte followed by seven body bytes. Payload byte = body low seven
/// bits shifted up one, LSB from the carrier. A frame is valid when its
/// byte-sum is 0 mod 256 and the first payload byte's top bit is clear; the
/// opposite flag polarity from device frames, kept as the hardware behaves.
pub struct MacToDcd {
    state: HostState,
    first_byte: bool,
    in_groups:  u8,
    data: Vec<u8>,
    idx:  usize,
}

impl MacToDcd {
    pub fn new() -> MacToDcd {
        MacToDcd {
            state: HostState::SeekingSync,
            first_byte: true,
            in_groups: 0,
            data: Vec::new(),
            idx: 0,
        }
    }

    pub fn reset(&mut self) {
        *self = MacToDcd::new();
    }

    /// The `in_groups` header and assembled payload of a completed frame.
    /// `in_groups` seeds the peer decoder for the device's reply.
    pub fn result(&self) -> (u8, &[u8]) {
        (self.in_groups, &self.data)
    }

    pub fn feed(&mut self, byte: u8) -> FeedResult {
        if matches!(self.state, HostState::Complete { .. }) {
            return FeedResult {
                synced:  false,
                outcome: FeedOutcome::GaveUp,
            };
        }
        let synced = self.first_byte;
        self.first_byte = false;

        match &mut self.state {
            HostState::SeekingSync => {
                if byte == SYNC_BYTE {
                    self.state = HostState::ReadingOutGroups;
                }
            }
            HostState::Holdoff => {
                if byte == SYNC_BYTE {
                    self.state = HostState::AwaitingCarrier;
                }
            }
            HostState::ReadingOutGroups => {
                let groups = byte & 0x7F;
                if groups != 0 {
                    self.data = vec![0; groups as usize * DCD_GROUP_LEN];
                    self.idx = 0;
                    self.state = HostState::ReadingInGroups;
                }
            }
            HostState::ReadingInGroups => {
                let groups = byte & 0x7F;
                if groups != 0 {
                    self.in_groups = groups;
                    self.state = HostState::AwaitingCarrier;
                }
            }
            HostState::AwaitingCarrier => {
                self.state = HostState::ReadingPayload { carrier: byte | 0x80 };
            }
            HostState::ReadingPayload { carrier } => {
                let lsb = *carrier & 0x01;
                *carrier >>= 1;
                let exhausted = *carrier == 0x01;
                let holdoff = exhausted && byte & 0x80 == 0;

                self.data[self.idx] = ((byte & 0x7F) << 1) | lsb;
                self.idx += 1;
                if self.idx == self.data.len() {
                    let valid = byte_sum_balanced(&self.data) && self.data[0] & 0x80 == 0;
                    self.state = HostState::Complete { valid };
                    return FeedResult {
                        synced,
                        outcome: FeedOutcome::Complete { valid },
                    };
                }
                if holdoff {
                    self.state = HostState::Holdoff;
                }
                else if exhausted {
                    self.state = HostState::AwaitingCarrier;
                }
            }
            HostState::Complete { .. } => unreachable!(),
        }
        FeedResult {
            synced,
            outcome: FeedOutcome::Hopeful,
        }
    }
}

impl Default for MacToDcd {
    fn default() -> Self {
        MacToDcd::new()
    }
}

#[derive(Debug)]
enum DeviceState {
    /// Not seeded with an expected length; the device only speaks when a
    /// completed host frame has declared `in_groups`.
    Inactive,
    SeekingSync,
    ReadingPayload,
    AwaitingCarrier,
    Holdoff,
    Complete { valid: bool },
}

/// Decoder for device-to-host frames.
///
/// Frame layout: sync, then `in_groups` groups of seven body bytes followed
/// by a carrier byte whose bits 0..6 supply the groups' LSBs and whose bit 7
/// is the continuation flag. Validity requires the first payload byte's top
/// bit SET (the host direction expects it clear).
pub struct DcdToMac {
    state: DeviceState,
    first_byte: bool,
    in_groups:  u8,
    data: Vec<u8>,
    idx:  usize,
}

impl DcdToMac {
    pub fn new() -> DcdToMac {
        let mut decoder = DcdToMac {
            state: DeviceState::Inactive,
            first_byte: true,
            in_groups: 0,
            data: Vec::new(),
            idx: 0,
        };
        decoder.reset(0);
        decoder
    }

    pub fn reset(&mut self, in_groups: u8) {
        self.state = if in_groups != 0 {
            DeviceState::SeekingSync
        }
        else {
            DeviceState::Inactive
        };
        self.first_byte = true;
        self.in_groups = in_groups;
        self.data = vec![0; in_groups as usize * DCD_GROUP_LEN];
        self.idx = 0;
    }

    pub fn result(&self) -> (u8, &[u8]) {
        (self.in_groups, &self.data)
    }

    pub fn feed(&mut self, byte: u8) -> FeedResult {
        if matches!(self.state, DeviceState::Inactive | DeviceState::Complete { .. }) {
            return FeedResult {
                synced:  false,
                outcome: FeedOutcome::GaveUp,
            };
        }
        let synced = self.first_byte;
        self.first_byte = false;

        match self.state {
            DeviceState::SeekingSync => {
                if byte == SYNC_BYTE {
                    self.state = DeviceState::ReadingPayload;
                }
            }
            DeviceState::Holdoff => {
                if byte == SYNC_BYTE {
                    self.state = DeviceState::ReadingPayload;
                }
            }
            DeviceState::ReadingPayload => {
                self.data[self.idx] = byte & 0x7F;
                self.idx += 1;
                if self.idx % DCD_GROUP_LEN == 0 {
                    self.state = DeviceState::AwaitingCarrier;
                }
            }
            DeviceState::AwaitingCarrier => {
                for bit in 0..DCD_GROUP_LEN {
                    let slot = self.idx - DCD_GROUP_LEN + bit;
                    self.data[slot] = (self.data[slot] << 1) | ((byte >> bit) & 0x01);
                }
                let holdoff = byte & 0x80 == 0;
                if self.idx == self.data.len() {
                    let valid = byte_sum_balanced(&self.data) && self.data[0] & 0x80 != 0;
                    self.state = DeviceState::Complete { valid };
                    return FeedResult {
                        synced,
                        outcome: FeedOutcome::Complete { valid },
                    };
                }
                self.state = if holdoff {
                    DeviceState::Holdoff
                }
                else {
                    DeviceState::ReadingPayload
                };
            }
            DeviceState::Inactive | DeviceState::Complete { .. } => unreachable!(),
        }
        FeedResult {
            synced,
            outcome: FeedOutcome::Hopeful,
        }
    }
}

impl Default for DcdToMac {
    fn default() -> Self {
        DcdToMac::new()
    }
}

/// Overwrite the last byte of `payload` so its byte-sum balances to zero.
pub fn balance_checksum(payload: &mut [u8]) {
    if let Some((last, rest)) = payload.split_last_mut() {
        *last = 0u8.wrapping_sub(rest.iter().fold(0u8, |sum, b| sum.wrapping_add(*b)));
    }
}

fn group_count(payload: &[u8]) -> Result<u8, crate::AnalyzerError> {
    if payload.is_empty() || payload.len() % DCD_GROUP_LEN != 0 || payload.len() / DCD_GROUP_LEN > 0x7F {
        log::error!("frame payload must be 1..=127 groups of {} bytes", DCD_GROUP_LEN);
        return Err(crate::AnalyzerError::ParameterError);
    }
    Ok((payload.len() / DCD_GROUP_LEN) as u8)
}

/// Pack a host-to-device frame around `payload` (checksum byte included;
/// see [balance_checksum]).
pub fn encode_host_frame(payload: &[u8], in_groups: u8) -> Result<Vec<u8>, crate::AnalyzerError> {
    let out_groups = group_count(payload)?;
    if in_groups == 0 || in_groups > 0x7F {
        log::error!("in_groups must be 1..=127");
        return Err(crate::AnalyzerError::ParameterError);
    }
    let mut wire = vec![SYNC_BYTE, 0x80 | out_groups, 0x80 | in_groups];
    for group in payload.chunks(DCD_GROUP_LEN) {
        let mut carrier = 0x80u8;
        for (i, byte) in group.iter().enumerate() {
            carrier |= (byte & 0x01) << i;
        }
        wire.push(carrier);
        wire.extend(group.iter().map(|byte| 0x80 | (byte >> 1)));
    }
    Ok(wire)
}

/// Pack a device-to-host frame around `payload` (checksum byte included).
pub fn encode_drive_frame(payload: &[u8]) -> Result<Vec<u8>, crate::AnalyzerError> {
    group_count(payload)?;
    let mut wire = vec![SYNC_BYTE];
    for group in payload.chunks(DCD_GROUP_LEN) {
        wire.extend(group.iter().map(|byte| 0x80 | (byte >> 1)));
        let mut carrier = 0x80u8;
        for (i, byte) in group.iter().enumerate() {
            carrier |= (byte & 0x01) << i;
        }
        wire.push(carrier);
    }
    Ok(wire)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_payload(groups: usize) -> Vec<u8> {
        let mut payload: Vec<u8> = (0..groups * DCD_GROUP_LEN)
            .map(|i| (i as u8).wrapping_mul(37).wrapping_add(5) & 0x7F)
            .collect();
        // Host frames carry the first byte's top bit clear.
        payload[0] &= 0x7F;
        balance_checksum(&mut payload);
        payload
    }

    fn feed_all(decoder: &mut MacToDcd, wire: &[u8]) -> Vec<FeedResult> {
        wire.iter().map(|b| decoder.feed(*b)).collect()
    }

    #[test]
    fn host_frame_round_trips() {
        let payload = host_payload(2);
        let wire = encode_host_frame(&payload, 1).unwrap();
        assert_eq!(wire.len(), 3 + 2 * 8);

        let mut decoder = MacToDcd::new();
        let results = feed_all(&mut decoder, &wire);

        // The sync event fires on the first byte only.
        assert!(results[0].synced);
        assert!(results[1..].iter().all(|r| !r.synced));
        assert_eq!(results.last().unwrap().outcome, FeedOutcome::Complete { valid: true });

        let (in_groups, data) = decoder.result();
        assert_eq!(in_groups, 1);
        assert_eq!(data, &payload[..]);
    }

    #[test]
    fn host_frame_detects_corruption() {
        let payload = host_payload(2);
        let mut wire = encode_host_frame(&payload, 1).unwrap();
        // Flip one payload bit in the second group's body.
        wire[13] ^= 0x04;

        let mut decoder = MacToDcd::new();
        let results = feed_all(&mut decoder, &wire);
        assert_eq!(results.last().unwrap().outcome, FeedOutcome::Complete { valid: false });

        // A finished decoder is inert until reset.
        assert_eq!(decoder.feed(0xAA).outcome, FeedOutcome::GaveUp);
    }

    #[test]
    fn host_frame_honors_holdoff() {
        let payload = host_payload(2);
        let wire = encode_host_frame(&payload, 3).unwrap();

        // Clear the continuation flag on the first group's final body byte
        // and resume the second group after a fresh sync byte.
        let mut gapped = wire[..10].to_vec();
        gapped.push(wire[10] & 0x7F);
        gapped.push(SYNC_BYTE);
        gapped.extend_from_slice(&wire[11..]);

        let mut decoder = MacToDcd::new();
        let results = feed_all(&mut decoder, &gapped);
        assert_eq!(results.last().unwrap().outcome, FeedOutcome::Complete { valid: true });
        // The mid-frame resync does not fire another sync event.
        assert_eq!(results.iter().filter(|r| r.synced).count(), 1);

        let (in_groups, data) = decoder.result();
        assert_eq!(in_groups, 3);
        assert_eq!(data, &payload[..]);
    }

    #[test]
    fn zero_group_headers_are_reread() {
        let payload = host_payload(1);
        let wire = encode_host_frame(&payload, 2).unwrap();

        // 0x80 has an empty low-7-bit group count in either header slot.
        let mut padded = vec![SYNC_BYTE, 0x80, 0x80];
        padded.extend_from_slice(&wire[1..]);

        let mut decoder = MacToDcd::new();
        let results = feed_all(&mut decoder, &padded);
        assert_eq!(results.last().unwrap().outcome, FeedOutcome::Complete { valid: true });
        assert_eq!(decoder.result().0, 2);
    }

    #[test]
    fn drive_frame_round_trips() {
        let mut payload: Vec<u8> = (0..DCD_GROUP_LEN).map(|i| 0x80 | i as u8).collect();
        balance_checksum(&mut payload);
        // Device frames carry the first byte's top bit set.
        assert!(payload[0] & 0x80 != 0);
        let wire = encode_drive_frame(&payload).unwrap();

        let mut decoder = DcdToMac::new();
        // Unseeded, the decoder ignores everything.
        assert_eq!(decoder.feed(SYNC_BYTE).outcome, FeedOutcome::GaveUp);

        decoder.reset(1);
        let results: Vec<FeedResult> = wire.iter().map(|b| decoder.feed(*b)).collect();
        assert!(results[0].synced);
        assert_eq!(results.last().unwrap().outcome, FeedOutcome::Complete { valid: true });
        assert_eq!(decoder.result().1, &payload[..]);
    }

    #[test]
    fn drive_frame_polarity_is_opposite() {
        // A payload valid for the host direction (top bit clear) fails the
        // device direction's flag check.
        let mut payload: Vec<u8> = vec![0x01; DCD_GROUP_LEN];
        balance_checksum(&mut payload);
        let wire = encode_drive_frame(&payload).unwrap();

        let mut decoder = DcdToMac::new();
        decoder.reset(1);
        let last = wire.iter().map(|b| decoder.feed(*b)).last().unwrap();
        assert_eq!(last.outcome, FeedOutcome::Complete { valid: false });
    }
}
