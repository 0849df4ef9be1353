use std::sync::Arc;

use crate::common::phys::PhysReader;
use crate::constants::limits;
use crate::decode::FrameDecodeLevel;
use crate::error::RequestError;
use crate::serial::frame::{rtu_bidirectional_size, rtu_size_from_header, Frame, RtuDisplay};
use crate::serial::{SerialOptions, Stats, Timing};

/// Which side of the protocol the reader expects the incoming frames to have
/// originated from; this drives length inference from partial headers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReaderRole {
    /// a client reading server-originated frames
    Client,
    /// a server reading client-originated frames
    Server,
    /// frames may come from either side; the CRC disambiguates
    Bidirectional,
}

/// Extracts one complete RTU frame per call from a timed byte stream.
///
/// Writes arrive fragmented; frames are delimited by 3.5 characters of
/// silence. The reader accumulates bytes until length inference from the
/// partial header is satisfied, pacing its waits by the transmission time of
/// the bytes still missing. When hardware buffering concatenates two frames
/// into one read, the surplus is stashed for the next call.
pub(crate) struct RtuPacketReader {
    io: PhysReader,
    role: ReaderRole,
    timing: Timing,
    options: SerialOptions,
    stats: Arc<Stats>,
    decode: FrameDecodeLevel,
    stash: Vec<u8>,
}

impl RtuPacketReader {
    pub(crate) fn new(
        io: PhysReader,
        role: ReaderRole,
        timing: Timing,
        options: SerialOptions,
        stats: Arc<Stats>,
        decode: FrameDecodeLevel,
    ) -> Self {
        Self {
            io,
            role,
            timing,
            options,
            stats,
            decode,
            stash: Vec::new(),
        }
    }

    fn expected_size(&self, header: &[u8]) -> usize {
        let over_size = self.options.over_size_support;
        match self.role {
            ReaderRole::Client => rtu_size_from_header(header, true, over_size),
            ReaderRole::Server => rtu_size_from_header(header, false, over_size),
            ReaderRole::Bidirectional => rtu_bidirectional_size(header, over_size),
        }
    }

    pub(crate) async fn read_frame(&mut self) -> Result<Frame, RequestError> {
        self.stats.inc_read_packets();

        let max = if self.options.over_size_support {
            self.options.over_size_max_rtu.min(limits::OVER_SIZE_MAX_RTU)
        } else {
            limits::MAX_RTU_SIZE
        };
        let mut storage = [0u8; limits::OVER_SIZE_MAX_RTU];
        let buf = &mut storage[..max];

        let mut read = 0;
        let mut expected = limits::SMALLEST_RTU_SIZE;
        while read < expected {
            if !self.stash.is_empty() {
                let n = self.stash.len().min(buf.len() - read);
                buf[read..read + n].copy_from_slice(&self.stash[..n]);
                self.stash.drain(..n);
                read += n;
            } else if read == 0 {
                read += self.io.read(buf).await?;
            } else {
                // mid-frame: bound the wait for the remainder so a stalled
                // sender cannot wedge the engine
                let cutoff = self.timing.packet_cutoff(expected - read);
                match tokio::time::timeout(cutoff, self.io.read(&mut buf[read..])).await {
                    Ok(n) => read += n?,
                    Err(_) => break,
                }
            }
            if read == buf.len() {
                break;
            }
            if read < expected {
                continue;
            }
            expected = self.expected_size(&buf[..read]).min(buf.len());
            if expected > read {
                // give the remainder time to arrive before reading again
                tokio::time::sleep(self.timing.bytes_delay(expected - read)).await;
            }
        }

        if read > expected {
            if crate::common::crc::validate(&buf[..expected]) {
                // two frames concatenated by hardware buffering
                self.stats.inc_long_read_warnings();
                self.stash.extend_from_slice(&buf[expected..read]);
                tracing::debug!("long read: kept {} of {} bytes", expected, read);
                read = expected;
            } else if crate::common::crc::validate(&buf[..read]) {
                // the longer read was the correct interpretation
                self.stats.inc_format_warnings();
            }
        }

        let frame = Frame::from_slice(&buf[..read]);
        if self.decode.enabled() {
            tracing::info!("RTU RX - {}", RtuDisplay::new(self.decode, &frame));
        }
        Ok(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::phys;
    use crate::decode::PhysDecodeLevel;
    use tokio::io::AsyncWriteExt;

    const READ_REGS_REQ: &[u8] = &[0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87];
    const WRITE_COIL_REQ: &[u8] = &[0x11, 0x05, 0x00, 0xAC, 0xFF, 0x00, 0x4E, 0x8B];

    fn reader(io: tokio::io::DuplexStream, role: ReaderRole) -> RtuPacketReader {
        let (rx, _tx) = phys::split(io, PhysDecodeLevel::Nothing);
        RtuPacketReader::new(
            rx,
            role,
            Timing::new(1_000_000, std::time::Duration::from_millis(50)),
            SerialOptions::default(),
            Arc::new(Stats::default()),
            FrameDecodeLevel::Nothing,
        )
    }

    #[tokio::test]
    async fn reads_one_frame_per_call() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut reader = reader(local, ReaderRole::Server);

        remote.write_all(READ_REGS_REQ).await.unwrap();
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.as_bytes(), READ_REGS_REQ);
    }

    #[tokio::test]
    async fn reassembles_fragmented_frames() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut reader = reader(local, ReaderRole::Server);

        let (a, b) = READ_REGS_REQ.split_at(5);
        remote.write_all(a).await.unwrap();
        let pending = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            remote.write_all(b).await.unwrap();
            remote
        });
        let frame = reader.read_frame().await.unwrap();
        assert_eq!(frame.as_bytes(), READ_REGS_REQ);
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn stashes_concatenated_frames() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut reader = reader(local, ReaderRole::Server);

        let mut joined = READ_REGS_REQ.to_vec();
        joined.extend_from_slice(WRITE_COIL_REQ);
        remote.write_all(&joined).await.unwrap();

        let first = reader.read_frame().await.unwrap();
        assert_eq!(first.as_bytes(), READ_REGS_REQ);
        let second = reader.read_frame().await.unwrap();
        assert_eq!(second.as_bytes(), WRITE_COIL_REQ);
        assert_eq!(reader.stats.long_read_warnings(), 1);
    }

    #[tokio::test]
    async fn bidirectional_reader_handles_both_directions() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let mut reader = reader(local, ReaderRole::Bidirectional);

        const READ_REGS_REP: &[u8] = &[
            0x11, 0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40, 0x49, 0xAD,
        ];
        remote.write_all(READ_REGS_REQ).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().as_bytes(), READ_REGS_REQ);
        remote.write_all(READ_REGS_REP).await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().as_bytes(), READ_REGS_REP);
    }
}
