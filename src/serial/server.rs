use std::sync::Arc;

use tokio::sync::mpsc;

use crate::common::pdu::{Pdu, PduDisplay};
use crate::common::phys::PhysWriter;
use crate::constants::limits;
use crate::decode::DecodeLevel;
use crate::error::{FrameParseError, RequestError};
use crate::exception::ExceptionCode;
use crate::failover::{Failover, FailoverConn, ReadDisposition, WriteDisposition};
use crate::handler::ProtocolHandler;
use crate::serial::frame::{Frame, RtuDisplay};
use crate::serial::reader::{ReaderRole, RtuPacketReader};
use crate::serial::{SerialContext, SerialOptions, Stats, Timing};
use crate::types::SlaveId;

/// Requests that the engine holding the other end stop serving.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: mpsc::Sender<()>,
}

impl ShutdownHandle {
    /// Ask the engine to return from `serve`. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Server (slave) side engine for Modbus RTU: one serial context, one slave
/// address, one handler.
///
/// `serve` reads frames, validates them, dispatches to the handler and emits
/// replies or exceptions. It never replies to broadcast and never speaks
/// unsolicited. It returns only when the underlying stream fails or the
/// [`ShutdownHandle`] fires.
pub struct RtuServer {
    reader: RtuPacketReader,
    writer: PhysWriter,
    slave_id: SlaveId,
    timing: Timing,
    options: SerialOptions,
    stats: Arc<Stats>,
    decode: DecodeLevel,
    failover: Option<Arc<Failover>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl RtuServer {
    /// A server alone on its side of the bus.
    pub fn new(ctx: SerialContext, slave_id: SlaveId) -> Self {
        Self::build(ctx, slave_id, None, ReaderRole::Server)
    }

    /// A server sharing the bus and slave address with a failover peer.
    pub fn new_failover(conn: FailoverConn, slave_id: SlaveId) -> Self {
        // peer traffic flows both ways, so frames must be sized bidirectionally
        Self::build(
            conn.ctx,
            slave_id,
            Some(conn.shared),
            ReaderRole::Bidirectional,
        )
    }

    fn build(
        ctx: SerialContext,
        slave_id: SlaveId,
        failover: Option<Arc<Failover>>,
        role: ReaderRole,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let reader = RtuPacketReader::new(
            ctx.reader,
            role,
            ctx.timing,
            ctx.options,
            ctx.stats.clone(),
            ctx.decode.frame,
        );
        Self {
            reader,
            writer: ctx.writer,
            slave_id,
            timing: ctx.timing,
            options: ctx.options,
            stats: ctx.stats,
            decode: ctx.decode,
            failover,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// A handle that makes `serve` return [`RequestError::Shutdown`].
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serve requests until the stream fails or the shutdown handle fires.
    pub async fn serve<H: ProtocolHandler>(mut self, handler: &mut H) -> RequestError {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown_rx.recv() => return RequestError::Shutdown,
                frame = next_frame(&mut self.reader, &self.failover) => match frame {
                    Ok(frame) => frame,
                    Err(err) => return err,
                },
            };
            if let Err(err) = self.process(handler, frame).await {
                return err;
            }
        }
    }

    async fn process<H: ProtocolHandler>(
        &mut self,
        handler: &mut H,
        frame: Frame,
    ) -> Result<(), RequestError> {
        let pdu = match frame.pdu() {
            Ok(pdu) => pdu,
            Err(FrameParseError::CrcValidationFailure) => {
                self.stats.inc_crc_errors();
                return Ok(());
            }
            Err(_) => {
                self.stats.inc_other_errors();
                return Ok(());
            }
        };
        if !frame.is_broadcast() && frame.slave_id() != self.slave_id {
            self.stats.inc_id_drops();
            tracing::debug!("dropped frame addressed to {}", frame.slave_id());
            return Ok(());
        }
        let reply_to = frame.slave_id();

        if let Err(code) = pdu.validate_request() {
            self.stats.inc_other_errors();
            return self.reply(reply_to, &pdu.exception_reply(code)).await;
        }
        let fc = match pdu.function_code() {
            Some(fc) => fc,
            None => return Ok(()),
        };
        if self.decode.app.enabled() {
            tracing::info!("PDU RX - {}", PduDisplay::new(self.decode.app, &pdu));
        }

        if fc.is_read_to_server() {
            if let Err(code) = check_read_range(&pdu) {
                self.stats.inc_other_errors();
                return self.reply(reply_to, &pdu.exception_reply(code)).await;
            }
            match handler.on_read(&pdu) {
                Ok(data) => self.reply(reply_to, &pdu.make_read_reply(&data)).await,
                Err(err) => {
                    self.stats.inc_other_errors();
                    tracing::warn!("handler rejected {}: {}", fc, err);
                    self.reply(reply_to, &pdu.exception_reply(err.to_exception()))
                        .await
                }
            }
        } else {
            let result = pdu
                .request_values(self.options.over_size_support)
                .map_err(Into::into)
                .and_then(|data| handler.on_write(&pdu, data));
            match result {
                Ok(()) => self.reply(reply_to, &pdu.make_write_reply()).await,
                Err(err) => {
                    self.stats.inc_other_errors();
                    tracing::warn!("handler rejected {}: {}", fc, err);
                    self.reply(reply_to, &pdu.exception_reply(err.to_exception()))
                        .await
                }
            }
        }
    }

    async fn reply(&mut self, to: SlaveId, pdu: &Pdu) -> Result<(), RequestError> {
        if to.is_broadcast() {
            return Ok(());
        }
        let frame = Frame::wrap(to, pdu);
        // respect the inter-frame gap before transmitting
        tokio::time::sleep(self.timing.min_delay()).await;
        if let Some(failover) = &self.failover {
            match failover.server_write_gate(frame.len()) {
                WriteDisposition::Drop => return Ok(()),
                WriteDisposition::SleepRecheck(delay) => {
                    tokio::time::sleep(delay).await;
                    if !failover.server_write_recheck() {
                        tracing::debug!("reply withheld, primary answered first");
                        return Ok(());
                    }
                }
                WriteDisposition::Transmit => {}
            }
        }
        if self.decode.frame.enabled() {
            tracing::info!("RTU TX - {}", RtuDisplay::new(self.decode.frame, &frame));
        }
        self.writer.write(frame.as_bytes()).await?;
        Ok(())
    }
}

/// Read frames until the failover coordinator (when present) delivers one.
pub(crate) async fn next_frame(
    reader: &mut RtuPacketReader,
    failover: &Option<Arc<Failover>>,
) -> Result<Frame, RequestError> {
    loop {
        let frame = reader.read_frame().await?;
        match failover {
            None => return Ok(frame),
            Some(failover) => match failover.observe_server_read(&frame) {
                ReadDisposition::Deliver => return Ok(frame),
                ReadDisposition::Discard => continue,
            },
        }
    }
}

fn check_read_range(pdu: &Pdu) -> Result<(), ExceptionCode> {
    let count = pdu.request_count();
    if count == 0 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    if pdu.address() as u32 + count as u32 > limits::ADDRESS_SPACE {
        return Err(ExceptionCode::IllegalDataAddress);
    }
    Ok(())
}
