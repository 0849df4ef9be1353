//! Hot-standby coordination over a shared serial bus.
//!
//! Two endpoints share one bus and one slave address; at most one of them may
//! speak. Each wraps its serial context in a [`FailoverConn`], which decides
//! from passive traffic observation alone whether the local endpoint is
//! currently allowed to transmit. The engine above is unchanged: reads and
//! writes simply pass through the coordinator's rules.

mod client;

pub use client::FailoverRtuClient;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::common::pdu::is_request_reply;
use crate::serial::frame::Frame;
use crate::serial::{SerialContext, Timing};

/// Configurable delays and thresholds of the failover state machine.
#[derive(Clone, Copy, Debug)]
pub struct FailoverTimings {
    /// Extra wait before the failover side speaks, giving the primary the
    /// first opportunity to reply.
    pub secondary_delay: Duration,
    /// Threshold over which a passive observer concludes the active peer
    /// missed its turn. Must exceed `secondary_delay`.
    pub miss_delay: Duration,
    /// Bus silence after which an active primary reverts to passive.
    pub primary_disconnect_delay: Duration,
    /// After this long passive, a primary forcibly retakes the bus.
    pub primary_force_back_delay: Duration,
    /// Consecutive missed turns that trigger a takeover.
    pub misses_max: u32,
}

impl Default for FailoverTimings {
    fn default() -> Self {
        Self {
            secondary_delay: Duration::from_millis(100),
            miss_delay: Duration::from_millis(200),
            primary_disconnect_delay: Duration::from_secs(3),
            primary_force_back_delay: Duration::from_secs(600),
            misses_max: 3,
        }
    }
}

/// A serial context wrapped with failover rules. Attach it to an
/// [`RtuServer`](crate::serial::RtuServer) via `new_failover` or to a
/// [`FailoverRtuClient`]; the engine consumes the context and keeps the
/// coordinator in its read and write paths.
pub struct FailoverConn {
    pub(crate) ctx: SerialContext,
    pub(crate) shared: Arc<Failover>,
}

impl FailoverConn {
    /// Wrap `ctx`. `is_failover` selects the designated role: the primary
    /// speaks by default, the failover side waits for the primary to go
    /// silent. The failover side gets two extra tolerated misses.
    pub fn new(ctx: SerialContext, is_failover: bool) -> Self {
        let mut timings = FailoverTimings::default();
        if is_failover {
            timings.misses_max += 2;
        }
        Self::with_timings(ctx, is_failover, timings)
    }

    /// Wrap `ctx` with explicit timings.
    pub fn with_timings(ctx: SerialContext, is_failover: bool, timings: FailoverTimings) -> Self {
        let shared = Arc::new(Failover {
            is_failover,
            is_client: AtomicBool::new(false),
            timings,
            timing: ctx.timing,
            over_size: ctx.options.over_size_support,
            state: Mutex::new(State {
                is_active: false,
                misses: 0,
                request_time: None,
                req_packet: Vec::new(),
                last_read: Instant::now(),
                start_time: Instant::now(),
            }),
        });
        Self { ctx, shared }
    }

    /// A handle for observing the coordinator after the engine has consumed
    /// this connection.
    pub fn monitor(&self) -> FailoverMonitor {
        FailoverMonitor {
            shared: self.shared.clone(),
        }
    }
}

/// Read-only view of a coordinator's dynamic state.
#[derive(Clone)]
pub struct FailoverMonitor {
    shared: Arc<Failover>,
}

impl FailoverMonitor {
    /// true while the local endpoint is the one allowed to transmit
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }
}

impl std::fmt::Display for FailoverMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.shared.describe())
    }
}

/// What to do with a frame that was just read from the bus.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ReadDisposition {
    /// hand the frame to the engine
    Deliver,
    /// the frame belongs to the peer's conversation; read another
    Discard,
}

/// What to do with bytes the engine wants to transmit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteDisposition {
    /// transmit on the bus
    Transmit,
    /// we are passive: swallow the bytes, reporting success to the engine
    Drop,
    /// failover server: wait this long for the primary to answer first, then
    /// re-check with [`Failover::server_write_recheck`]
    SleepRecheck(Duration),
}

/// The observational state machine. One mutex serializes the mutable state;
/// it is never held across the underlying stream's read or write.
pub(crate) struct Failover {
    is_failover: bool,
    is_client: AtomicBool,
    timings: FailoverTimings,
    timing: Timing,
    over_size: bool,
    state: Mutex<State>,
}

struct State {
    is_active: bool,
    misses: u32,
    /// time of the last passively observed packet, `None` if no transaction
    /// is outstanding
    request_time: Option<Instant>,
    /// the PDU of that packet, for pairing replies against it
    req_packet: Vec<u8>,
    last_read: Instant,
    start_time: Instant,
}

impl State {
    fn reset_request_time(&mut self) {
        self.request_time = None;
        self.req_packet.clear();
    }

    fn set_last_request(&mut self, pdu: &[u8], now: Instant) {
        self.request_time = Some(now);
        self.req_packet.clear();
        self.req_packet.extend_from_slice(pdu);
    }
}

impl Failover {
    pub(crate) fn attach_client(&self) {
        self.is_client.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_active(&self) -> bool {
        self.lock().is_active
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // lock scopes hold no await points, so poisoning is unreachable
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn describe(&self) -> String {
        format!(
            "failover conn {} {} {}",
            if self.is_client.load(Ordering::Relaxed) {
                "client"
            } else {
                "server"
            },
            if self.is_failover { "failover" } else { "primary" },
            if self.is_active() { "active" } else { "passive" },
        )
    }

    /// Primary-side activity bookkeeping shared by the read and write paths:
    /// force back onto the bus after long passivity, fall passive after long
    /// silence. Returns the resulting activity.
    fn primary_update(&self, state: &mut State, now: Instant) -> bool {
        if !state.is_active && state.start_time + self.timings.primary_force_back_delay < now {
            tracing::info!("primary retakes the bus after force-back delay");
            state.is_active = true;
            state.start_time = now;
        }
        if state.is_active && state.last_read + self.timings.primary_disconnect_delay < now {
            tracing::info!("primary passive after bus silence");
            state.is_active = false;
            state.start_time = now;
        }
        state.is_active
    }

    /// Server-side observation of one frame read off the bus.
    pub(crate) fn observe_server_read(&self, frame: &Frame) -> ReadDisposition {
        let now = Instant::now();
        let mut state = self.lock();

        if !self.is_failover && self.primary_update(&mut state, now) {
            state.last_read = now;
            return ReadDisposition::Deliver;
        }

        let pdu = match frame.pdu() {
            Ok(pdu) => pdu,
            // let the engine count and drop the bad frame
            Err(_) => {
                state.last_read = now;
                return ReadDisposition::Deliver;
            }
        };
        if frame.is_broadcast() {
            // no reply follows a broadcast, so nothing to pair
            state.reset_request_time();
            state.last_read = now;
            return ReadDisposition::Deliver;
        }

        if state.is_active {
            // only the failover side observes while active
            if state.request_time.is_none() {
                // a fresh client request; reply to it
                state.set_last_request(pdu.as_bytes(), now);
                state.last_read = now;
                return ReadDisposition::Deliver;
            }
            // the primary spoke while we were active: yield immediately
            tracing::info!("primary found, going from active to passive");
            state.is_active = false;
            state.misses = 0;
            state.reset_request_time();
            return ReadDisposition::Discard;
        }

        // passive observation
        match state.request_time {
            None => {
                state.set_last_request(pdu.as_bytes(), now);
                state.last_read = now;
                ReadDisposition::Deliver
            }
            Some(request_time) => {
                if now.duration_since(request_time)
                    > self.timings.miss_delay + self.timing.bytes_delay(frame.len())
                {
                    // the active server failed to answer in time
                    state.misses += 1;
                    if state.misses > self.timings.misses_max {
                        tracing::info!("taking over after {} misses", state.misses);
                        state.is_active = true;
                    } else {
                        state.set_last_request(pdu.as_bytes(), now);
                    }
                    state.last_read = now;
                    return ReadDisposition::Deliver;
                }
                state.misses = 0;
                if is_request_reply(&state.req_packet, pdu.as_bytes(), self.over_size) {
                    // the other server completed the transaction
                    state.reset_request_time();
                    return ReadDisposition::Discard;
                }
                // the stored packet was reply-shaped; treat this one as the request
                state.set_last_request(pdu.as_bytes(), now);
                state.last_read = now;
                ReadDisposition::Deliver
            }
        }
    }

    /// Client-side observation of one frame read off the bus. The frame is
    /// always delivered so the engine can try to harvest peer replies; this
    /// only updates the pairing state and deactivates a failover client when
    /// the primary proves it is alive.
    pub(crate) fn observe_client_read(&self, frame: &Frame) {
        let now = Instant::now();
        let mut state = self.lock();
        state.misses = 0;
        state.last_read = now;

        let pdu = match frame.pdu() {
            Ok(pdu) => pdu,
            Err(_) => return,
        };

        let is_reply = match state.request_time {
            Some(request_time) => {
                now.duration_since(request_time)
                    < self.timings.miss_delay + self.timing.bytes_delay(frame.len())
                    && is_request_reply(&state.req_packet, pdu.as_bytes(), self.over_size)
            }
            None => false,
        };
        if !is_reply {
            // a peer client's request on the bus
            state.set_last_request(pdu.as_bytes(), now);
            if self.is_failover && state.is_active {
                tracing::info!("deactivating failover client, primary is alive");
                state.is_active = false;
            }
            return;
        }
        state.reset_request_time();
    }

    /// Gate a client-side transmit.
    pub(crate) fn client_write_gate(&self, frame: &Frame) -> WriteDisposition {
        let now = Instant::now();
        let mut state = self.lock();

        if !self.is_failover {
            if state.is_active && state.last_read + self.timings.primary_disconnect_delay < now {
                tracing::info!("primary client passive, bus silent too long");
                state.is_active = false;
            }
            if !state.is_active && state.start_time + self.timings.primary_force_back_delay < now {
                tracing::info!("primary client active after force-back delay");
                state.is_active = true;
                state.start_time = now;
            }
        }

        if !state.is_active {
            if state.misses >= self.timings.misses_max {
                tracing::info!("client active after {} misses", state.misses);
                state.is_active = true;
            } else {
                state.misses += 1;
            }
        }

        if state.is_active {
            state.set_last_request(frame.pdu_bytes_unchecked(), now);
            return WriteDisposition::Transmit;
        }
        WriteDisposition::Drop
    }

    /// Gate a server-side transmit. The failover side must first yield the
    /// reply window to the primary; the caller sleeps and then confirms with
    /// [`Failover::server_write_recheck`].
    pub(crate) fn server_write_gate(&self, len: usize) -> WriteDisposition {
        let mut state = self.lock();
        if !state.is_active {
            return WriteDisposition::Drop;
        }
        if self.is_failover {
            return WriteDisposition::SleepRecheck(
                self.timings.secondary_delay + self.timing.bytes_delay(len),
            );
        }
        state.reset_request_time();
        WriteDisposition::Transmit
    }

    /// true if the reply should still be transmitted after the secondary
    /// delay elapsed
    pub(crate) fn server_write_recheck(&self) -> bool {
        let mut state = self.lock();
        if !state.is_active {
            return false;
        }
        state.reset_request_time();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::pdu::Pdu;
    use crate::types::SlaveId;

    fn conn(is_failover: bool) -> Arc<Failover> {
        let (io, _peer) = tokio::io::duplex(64);
        let ctx = SerialContext::new(io, 1_000_000);
        let mut timings = FailoverTimings {
            secondary_delay: Duration::from_millis(5),
            miss_delay: Duration::from_millis(10),
            ..FailoverTimings::default()
        };
        if is_failover {
            timings.misses_max += 2;
        }
        FailoverConn::with_timings(ctx, is_failover, timings).shared
    }

    fn request() -> Frame {
        Frame::wrap(
            SlaveId::new(0x11),
            &Pdu::from(&[0x03, 0x00, 0x6B, 0x00, 0x03][..]),
        )
    }

    fn reply() -> Frame {
        Frame::wrap(
            SlaveId::new(0x11),
            &Pdu::from(&[0x03, 0x06, 0xAE, 0x41, 0x56, 0x52, 0x43, 0x40][..]),
        )
    }

    #[test]
    fn passive_observer_discards_completed_pairs() {
        let failover = conn(true);
        assert_eq!(
            failover.observe_server_read(&request()),
            ReadDisposition::Deliver
        );
        // the peer's reply closes the transaction and is not delivered
        assert_eq!(
            failover.observe_server_read(&reply()),
            ReadDisposition::Discard
        );
        assert!(!failover.is_active());
    }

    #[test]
    fn missed_turns_promote_the_observer() {
        let failover = conn(true);
        let misses_max = failover.timings.misses_max;
        assert_eq!(
            failover.observe_server_read(&request()),
            ReadDisposition::Deliver
        );
        for _ in 0..=misses_max {
            std::thread::sleep(Duration::from_millis(15));
            assert_eq!(
                failover.observe_server_read(&request()),
                ReadDisposition::Deliver
            );
        }
        assert!(failover.is_active());
    }

    #[test]
    fn active_failover_yields_when_primary_speaks() {
        let failover = conn(true);
        failover.lock().is_active = true;
        // fresh client request while active: reply to it
        assert_eq!(
            failover.observe_server_read(&request()),
            ReadDisposition::Deliver
        );
        // another packet before we answered: the primary is back
        assert_eq!(
            failover.observe_server_read(&request()),
            ReadDisposition::Discard
        );
        assert!(!failover.is_active());
    }

    #[test]
    fn passive_server_drops_writes() {
        let failover = conn(false);
        assert_eq!(failover.server_write_gate(8), WriteDisposition::Drop);
    }

    #[test]
    fn active_failover_server_waits_before_writing() {
        let failover = conn(true);
        failover.lock().is_active = true;
        match failover.server_write_gate(8) {
            WriteDisposition::SleepRecheck(_) => {}
            other => panic!("expected sleep-recheck, got {other:?}"),
        }
        assert!(failover.server_write_recheck());
        // deactivated during the sleep: the reply must be dropped
        failover.lock().is_active = false;
        assert!(!failover.server_write_recheck());
    }

    #[test]
    fn passive_client_counts_misses_then_promotes() {
        let failover = conn(true);
        let frame = request();
        let misses_max = failover.timings.misses_max;
        for _ in 0..misses_max {
            assert_eq!(
                failover.client_write_gate(&frame),
                WriteDisposition::Drop
            );
        }
        assert_eq!(
            failover.client_write_gate(&frame),
            WriteDisposition::Transmit
        );
        assert!(failover.is_active());
    }

    #[test]
    fn client_observation_deactivates_on_peer_request() {
        let failover = conn(true);
        failover.lock().is_active = true;
        failover.observe_client_read(&request());
        assert!(!failover.is_active());
    }
}
