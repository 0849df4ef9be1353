use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::common::function::FunctionCode;
use crate::common::pdu::{is_request_reply, Pdu};
use crate::common::phys::PhysWriter;
use crate::constants::limits;
use crate::decode::DecodeLevel;
use crate::error::{AduParseError, FrameParseError, RequestError};
use crate::failover::{Failover, FailoverConn, WriteDisposition};
use crate::handler::ProtocolHandler;
use crate::serial::client::{Event, Transaction, TransactionHandle};
use crate::serial::frame::{Frame, RtuDisplay};
use crate::serial::reader::{ReaderRole, RtuPacketReader};
use crate::serial::{SerialOptions, Stats, Timing};
use crate::types::SlaveId;

/// Client (master) side engine for RTU with failover: two such clients share
/// one bus, and only the active one actually transmits.
///
/// This engine expects plenty of "unexpected" reads and "lost" writes.
/// Peer transactions observed on the bus are paired up, and the values of
/// peer read replies are delivered to the local handler's `on_write`, keeping
/// both clients in sync with the server's data even when only one of them
/// transacts. When the coordinator is passive at transmit time the
/// transaction is acknowledged as success without waiting for a reply.
pub struct FailoverRtuClient {
    reader: Option<RtuPacketReader>,
    writer: PhysWriter,
    slave_id: SlaveId,
    server_processing_time: Duration,
    timing: Timing,
    options: SerialOptions,
    stats: Arc<Stats>,
    decode: DecodeLevel,
    failover: Arc<Failover>,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl FailoverRtuClient {
    /// Create a failover client over a wrapped serial context.
    pub fn new(conn: FailoverConn, slave_id: SlaveId) -> Self {
        let FailoverConn { ctx, shared } = conn;
        shared.attach_client();
        let (tx, rx) = mpsc::channel(4);
        let reader = RtuPacketReader::new(
            ctx.reader,
            ReaderRole::Bidirectional,
            ctx.timing,
            ctx.options,
            ctx.stats.clone(),
            ctx.decode.frame,
        );
        Self {
            reader: Some(reader),
            writer: ctx.writer,
            slave_id,
            server_processing_time: Duration::from_secs(1),
            timing: ctx.timing,
            options: ctx.options,
            stats: ctx.stats,
            decode: ctx.decode,
            failover: shared,
            tx,
            rx,
        }
    }

    /// The time budget for the server to think, on top of transmission time.
    pub fn set_server_processing_time(&mut self, time: Duration) {
        self.server_processing_time = time;
    }

    /// A handle for starting transactions while `serve` runs.
    pub fn handle(&self) -> TransactionHandle {
        TransactionHandle::new(self.tx.clone(), self.slave_id)
    }

    fn transaction_timeout(&self, request_len: usize) -> Duration {
        let answer_len = if self.options.over_size_support {
            self.options.over_size_max_rtu
        } else {
            limits::MAX_RTU_SIZE
        };
        self.timing.bytes_delay(request_len + answer_len) + self.server_processing_time
    }

    /// Serve transactions until the stream fails or a handle calls `close`.
    pub async fn serve<H: ProtocolHandler>(mut self, handler: &mut H) -> RequestError {
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => return RequestError::Shutdown,
        };
        let events = self.tx.clone();
        let failover = self.failover.clone();
        tokio::spawn(async move {
            loop {
                match reader.read_frame().await {
                    Ok(frame) => {
                        // passive pairing runs on every frame off the bus
                        failover.observe_client_read(&frame);
                        if events.send(Event::Frame(frame)).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = events.send(Event::ReadError(err)).await;
                        return;
                    }
                }
            }
        });

        // the last unpaired peer request seen on the bus
        let mut last_peer_request: Vec<u8> = Vec::new();
        let mut pending: VecDeque<Transaction> = VecDeque::new();
        loop {
            let transaction = match pending.pop_front() {
                Some(transaction) => transaction,
                None => match self.rx.recv().await {
                    None | Some(Event::Shutdown) => return RequestError::Shutdown,
                    Some(Event::ReadError(err)) => return err,
                    Some(Event::Frame(frame)) => {
                        self.harvest(handler, &mut last_peer_request, &frame);
                        continue;
                    }
                    Some(Event::Start(transaction)) => transaction,
                },
            };
            if let Some(err) = self.run_transaction(handler, transaction, &mut pending).await {
                for queued in pending.drain(..) {
                    queued.complete(Err(err));
                }
                return err;
            }
        }
    }

    /// Pair peer requests with peer replies and deliver harvested read values
    /// to the local handler.
    fn harvest<H: ProtocolHandler>(
        &self,
        handler: &mut H,
        last_peer_request: &mut Vec<u8>,
        frame: &Frame,
    ) {
        let pdu = match frame.pdu() {
            Ok(pdu) => pdu,
            Err(_) => {
                self.stats.inc_other_drops();
                return;
            }
        };
        if !is_request_reply(last_peer_request, pdu.as_bytes(), self.options.over_size_support) {
            if !last_peer_request.is_empty() {
                self.stats.inc_other_drops();
            }
            last_peer_request.clear();
            last_peer_request.extend_from_slice(pdu.as_bytes());
            return;
        }
        let request = Pdu::from(last_peer_request.as_slice());
        last_peer_request.clear();

        let fc = match request.function_code() {
            Some(fc) => fc,
            None => return,
        };
        if fc.is_write_to_server() {
            // the peer pushed data to the server; nothing to mirror locally
            return;
        }
        match pdu.reply_values() {
            Ok(values) => {
                if let Err(err) = handler.on_write(&request, values) {
                    tracing::debug!("handler refused harvested values: {}", err);
                }
            }
            Err(_) => self.stats.inc_other_drops(),
        }
    }

    async fn run_transaction<H: ProtocolHandler>(
        &mut self,
        handler: &mut H,
        transaction: Transaction,
        pending: &mut VecDeque<Transaction>,
    ) -> Option<RequestError> {
        let Transaction { mut frame, reply } = transaction;
        let slave_id = frame.slave_id();
        let request = Pdu::from(frame.pdu_bytes_unchecked());

        if let Some(fc) = request.function_code() {
            if fc.is_write_to_server() {
                let data = match handler.on_read(&request) {
                    Ok(data) => data,
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return None;
                    }
                };
                match request.make_write_request(&data) {
                    Ok(full) => frame = Frame::wrap(slave_id, &full),
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return None;
                    }
                }
            }
        }
        let transaction = Transaction { frame, reply };

        tokio::time::sleep(self.timing.min_delay()).await;
        let transmitted = match self.failover.client_write_gate(&transaction.frame) {
            WriteDisposition::Transmit => {
                if self.decode.frame.enabled() {
                    tracing::info!(
                        "RTU TX - {}",
                        RtuDisplay::new(self.decode.frame, &transaction.frame)
                    );
                }
                if let Err(err) = self.writer.write(transaction.frame.as_bytes()).await {
                    let err = RequestError::from(err);
                    transaction.complete(Err(err));
                    return Some(err);
                }
                true
            }
            // passive: the bytes were swallowed, the engine proceeds as if sent
            _ => false,
        };

        if slave_id.is_broadcast() || !transmitted {
            tokio::time::sleep(self.timing.bytes_delay(transaction.frame.len())).await;
            transaction.complete(Ok(()));
            return None;
        }

        self.await_reply(handler, transaction, pending).await
    }

    async fn await_reply<H: ProtocolHandler>(
        &mut self,
        handler: &mut H,
        transaction: Transaction,
        pending: &mut VecDeque<Transaction>,
    ) -> Option<RequestError> {
        let deadline = Instant::now() + self.transaction_timeout(transaction.frame.len());
        loop {
            let event = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    transaction.complete(Err(RequestError::ResponseTimeout));
                    return None;
                }
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        transaction.complete(Err(RequestError::Shutdown));
                        return Some(RequestError::Shutdown);
                    }
                }
            };
            let frame = match event {
                Event::Shutdown => {
                    transaction.complete(Err(RequestError::Shutdown));
                    return Some(RequestError::Shutdown);
                }
                Event::ReadError(err) => {
                    transaction.complete(Err(err));
                    return Some(err);
                }
                Event::Start(next) => {
                    pending.push_back(next);
                    continue;
                }
                Event::Frame(frame) => frame,
            };

            if frame.slave_id() != transaction.frame.slave_id() {
                self.stats.inc_id_drops();
                continue;
            }
            let reply = match frame.pdu() {
                Ok(reply) => reply,
                Err(err) => {
                    match err {
                        FrameParseError::CrcValidationFailure => self.stats.inc_crc_errors(),
                        _ => self.stats.inc_other_errors(),
                    }
                    transaction.complete(Err(err.into()));
                    return None;
                }
            };

            let request = Pdu::from(transaction.frame.pdu_bytes_unchecked());
            let (exception, fc) = FunctionCode::separate_error(reply.raw_function());
            if exception && fc == request.raw_function() {
                self.stats.inc_remote_errors();
                handler.on_error(&request, &reply);
                transaction.complete(Err(RequestError::ServerException {
                    function: reply.raw_function(),
                    code: crate::exception::ExceptionCode::from_u8(
                        reply.as_bytes().get(1).copied().unwrap_or(0xFF),
                    ),
                }));
                return None;
            }
            if !is_request_reply(
                request.as_bytes(),
                reply.as_bytes(),
                self.options.over_size_support,
            ) {
                self.stats.inc_other_errors();
                transaction.complete(Err(AduParseError::UnexpectedReply.into()));
                return None;
            }

            match request.function_code() {
                Some(fc) if fc.is_read_to_server() => {
                    let result = reply
                        .reply_values()
                        .map_err(RequestError::from)
                        .and_then(|values| {
                            handler.on_write(&request, values).map_err(Into::into)
                        });
                    if result.is_err() {
                        self.stats.inc_other_errors();
                    }
                    transaction.complete(result);
                }
                _ => transaction.complete(Ok(())),
            }
            return None;
        }
    }
}
