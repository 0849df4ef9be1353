pub(crate) mod frame;
pub(crate) mod reader;

pub(crate) mod client;
pub(crate) mod server;

pub use client::{make_pdu_request_headers, make_pdu_request_headers_sized};
pub use client::{RtuClient, TransactionHandle};
pub use server::{RtuServer, ShutdownHandle};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::common::phys::{self, PhysReader, PhysWriter};
use crate::constants::limits;
use crate::decode::DecodeLevel;

/// Deployment-time options of a serial bus.
#[derive(Clone, Copy, Debug)]
pub struct SerialOptions {
    /// The longest the local host may stall mid-frame before the reader gives
    /// up on the remainder and breaks the packet apart.
    pub cpu_hiccup: Duration,
    /// Accept multi-write frames whose length is inferred from the quantity
    /// field rather than the declared byte count, for interop with peers that
    /// emit frames beyond the 256-byte limit.
    pub over_size_support: bool,
    /// Upper bound on frame size when `over_size_support` is enabled.
    pub over_size_max_rtu: usize,
}

impl Default for SerialOptions {
    fn default() -> Self {
        Self {
            cpu_hiccup: Duration::from_millis(100),
            over_size_support: false,
            over_size_max_rtu: limits::OVER_SIZE_MAX_RTU,
        }
    }
}

/// Timing parameters derived from the baud rate, assuming 8N1 framing
/// (11 bits per byte on the wire).
#[derive(Clone, Copy, Debug)]
pub(crate) struct Timing {
    baud_rate: u32,
    cpu_hiccup: Duration,
}

impl Timing {
    pub(crate) fn new(baud_rate: u32, cpu_hiccup: Duration) -> Self {
        Self {
            baud_rate,
            cpu_hiccup,
        }
    }

    /// The 3.5-character inter-frame gap, never below 1750 µs.
    pub(crate) fn min_delay(self) -> Duration {
        let floor = Duration::from_micros(1750);
        if self.baud_rate > 19_200 {
            return floor;
        }
        let b = self.baud_rate as u64;
        // ceil(11 bits * 3.5 chars / baud), in nanoseconds
        Duration::from_nanos((1_000_000_000 * 11 * 7 + b * 2 - 1) / (b * 2))
    }

    /// The time it takes to transmit `n` bytes at the configured baud rate.
    pub(crate) fn bytes_delay(self, n: usize) -> Duration {
        let b = self.baud_rate as u64;
        Duration::from_nanos((1_000_000_000 * 11 * n as u64 + b - 1) / b)
    }

    /// How long to wait for `n` expected bytes before forcing a packet break.
    pub(crate) fn packet_cutoff(self, n: usize) -> Duration {
        self.bytes_delay(n) + self.cpu_hiccup
    }
}

/// Statistics counters shared by everything attached to one serial bus.
#[derive(Debug, Default)]
pub struct Stats {
    read_packets: AtomicU64,
    crc_errors: AtomicU64,
    remote_errors: AtomicU64,
    other_errors: AtomicU64,
    long_read_warnings: AtomicU64,
    format_warnings: AtomicU64,
    id_drops: AtomicU64,
    other_drops: AtomicU64,
}

macro_rules! counter {
    ($get:ident, $inc:ident) => {
        pub fn $get(&self) -> u64 {
            self.$get.load(Ordering::Relaxed)
        }

        pub(crate) fn $inc(&self) {
            self.$get.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Stats {
    counter!(read_packets, inc_read_packets);
    counter!(crc_errors, inc_crc_errors);
    counter!(remote_errors, inc_remote_errors);
    counter!(other_errors, inc_other_errors);
    counter!(long_read_warnings, inc_long_read_warnings);
    counter!(format_warnings, inc_format_warnings);
    counter!(id_drops, inc_id_drops);
    counter!(other_drops, inc_other_drops);

    /// Every error counter added up: the total number of read packets dropped.
    pub fn total_drops(&self) -> u64 {
        self.crc_errors()
            + self.remote_errors()
            + self.other_errors()
            + self.long_read_warnings()
            + self.format_warnings()
            + self.id_drops()
            + self.other_drops()
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.read_packets.store(0, Ordering::Relaxed);
        self.crc_errors.store(0, Ordering::Relaxed);
        self.remote_errors.store(0, Ordering::Relaxed);
        self.other_errors.store(0, Ordering::Relaxed);
        self.long_read_warnings.store(0, Ordering::Relaxed);
        self.format_warnings.store(0, Ordering::Relaxed);
        self.id_drops.store(0, Ordering::Relaxed);
        self.other_drops.store(0, Ordering::Relaxed);
    }
}

/// A byte-oriented duplex stream paired with the baud-rate-derived timing that
/// RTU framing needs, plus shared statistics.
///
/// Any `AsyncRead + AsyncWrite` stream will do: a serial port, a pipe in
/// tests, or a TCP-tunneled bus. A context is consumed by exactly one engine.
pub struct SerialContext {
    pub(crate) reader: PhysReader,
    pub(crate) writer: PhysWriter,
    pub(crate) timing: Timing,
    pub(crate) options: SerialOptions,
    pub(crate) stats: Arc<Stats>,
    pub(crate) decode: DecodeLevel,
}

impl SerialContext {
    /// Create a context over `io` with default options and no decode logging.
    pub fn new<T>(io: T, baud_rate: u32) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_options(io, baud_rate, SerialOptions::default(), DecodeLevel::nothing())
    }

    /// Create a context with explicit options and decode logging levels.
    pub fn with_options<T>(
        io: T,
        baud_rate: u32,
        options: SerialOptions,
        decode: DecodeLevel,
    ) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = phys::split(io, decode.physical);
        Self {
            reader,
            writer,
            timing: Timing::new(baud_rate, options.cpu_hiccup),
            options,
            stats: Arc::new(Stats::default()),
            decode,
        }
    }

    /// The statistics counters of this bus, shared with the engine that
    /// consumes the context.
    pub fn stats(&self) -> Arc<Stats> {
        self.stats.clone()
    }

    /// The 3.5-character inter-frame gap.
    pub fn min_delay(&self) -> Duration {
        self.timing.min_delay()
    }

    /// The time it takes to transmit `n` bytes.
    pub fn bytes_delay(&self, n: usize) -> Duration {
        self.timing.bytes_delay(n)
    }

    /// The wait after which a partially received packet of `n` expected bytes
    /// is broken apart.
    pub fn packet_cutoff(&self, n: usize) -> Duration {
        self.timing.packet_cutoff(n)
    }
}

/// Open a serial port and wrap it in a [`SerialContext`] using the same baud
/// rate for the port and for timing.
#[cfg(feature = "serial")]
pub fn open(
    path: &str,
    baud_rate: u32,
    options: SerialOptions,
    decode: DecodeLevel,
) -> Result<SerialContext, std::io::Error> {
    use tokio_serial::SerialPortBuilderExt;
    let port = tokio_serial::new(path, baud_rate)
        .open_native_async()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
    Ok(SerialContext::with_options(port, baud_rate, options, decode))
}
