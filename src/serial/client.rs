use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::common::function::FunctionCode;
use crate::common::pdu::{is_request_reply, Pdu, PduDisplay};
use crate::common::phys::PhysWriter;
use crate::constants::limits;
use crate::decode::DecodeLevel;
use crate::error::{AduParseError, FrameParseError, InvalidRequest, RequestError};
use crate::handler::ProtocolHandler;
use crate::serial::frame::{Frame, RtuDisplay};
use crate::serial::reader::{ReaderRole, RtuPacketReader};
use crate::serial::{SerialContext, SerialOptions, Stats, Timing};
use crate::types::SlaveId;

pub(crate) enum Event {
    Start(Transaction),
    Frame(Frame),
    ReadError(RequestError),
    Shutdown,
}

pub(crate) struct Transaction {
    pub(crate) frame: Frame,
    pub(crate) reply: oneshot::Sender<Result<(), RequestError>>,
}

impl Transaction {
    pub(crate) fn complete(self, result: Result<(), RequestError>) {
        let _ = self.reply.send(result);
    }
}

/// Client (master) side engine for Modbus RTU.
///
/// `serve` multiplexes one background reader task against transaction starts
/// injected through [`TransactionHandle`]s, running at most one transaction
/// at a time; extra starts queue FIFO. A transaction that sees no valid reply
/// within `bytes_delay(request + max frame) + server_processing_time` fails
/// with [`RequestError::ResponseTimeout`].
pub struct RtuClient {
    reader: Option<RtuPacketReader>,
    writer: PhysWriter,
    slave_id: SlaveId,
    server_processing_time: Duration,
    timing: Timing,
    options: SerialOptions,
    stats: Arc<Stats>,
    decode: DecodeLevel,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl RtuClient {
    /// Create a client with the given default slave address for
    /// [`TransactionHandle::do_transaction`].
    pub fn new(ctx: SerialContext, slave_id: SlaveId) -> Self {
        let (tx, rx) = mpsc::channel(4);
        let reader = RtuPacketReader::new(
            ctx.reader,
            ReaderRole::Client,
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
            tx,
            rx,
        }
    }

    /// The time budget for the server to think, on top of transmission time.
    /// Defaults to one second.
    pub fn set_server_processing_time(&mut self, time: Duration) {
        self.server_processing_time = time;
    }

    /// A handle for starting transactions while `serve` runs.
    pub fn handle(&self) -> TransactionHandle {
        TransactionHandle {
            tx: self.tx.clone(),
            slave_id: self.slave_id,
        }
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
        tokio::spawn(async move {
            // Always ready to receive so that read data is fresh and frames
            // arriving at unexpected times still reach the dispatcher.
            loop {
                match reader.read_frame().await {
                    Ok(frame) => {
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

        let mut pending: VecDeque<Transaction> = VecDeque::new();
        loop {
            let transaction = match pending.pop_front() {
                Some(transaction) => transaction,
                None => match self.rx.recv().await {
                    None | Some(Event::Shutdown) => return RequestError::Shutdown,
                    Some(Event::ReadError(err)) => return err,
                    Some(Event::Frame(_)) => {
                        // nothing outstanding; stale traffic
                        self.stats.inc_other_drops();
                        continue;
                    }
                    Some(Event::Start(transaction)) => transaction,
                },
            };
            if let Some(err) = self.run_transaction(handler, transaction, &mut pending).await {
                // nothing queued is left hanging
                for queued in pending.drain(..) {
                    queued.complete(Err(err));
                }
                return err;
            }
        }
    }

    /// Run one transaction to completion. Returns an error only when the
    /// engine itself must stop.
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
                // the handler supplies the payload to ship
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

        if slave_id.is_broadcast() {
            // pace the bus, then report success; no reply follows a broadcast
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
                    // strictly FIFO: finish the in-flight transaction first
                    pending.push_back(next);
                    continue;
                }
                Event::Frame(frame) => frame,
            };

            if frame.slave_id() != transaction.frame.slave_id() {
                self.stats.inc_id_drops();
                tracing::debug!("unexpected slave id {}", frame.slave_id());
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

            if self.decode.app.enabled() {
                tracing::info!("PDU RX - {}", PduDisplay::new(self.decode.app, &reply));
            }
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
                    // data fetched from the server lands in the local handler
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

/// Starts transactions on an [`RtuClient`] whose `serve` loop is running.
/// Clonable; transactions from all handles are processed strictly FIFO.
#[derive(Clone)]
pub struct TransactionHandle {
    tx: mpsc::Sender<Event>,
    slave_id: SlaveId,
}

impl TransactionHandle {
    pub(crate) fn new(tx: mpsc::Sender<Event>, slave_id: SlaveId) -> Self {
        Self { tx, slave_id }
    }

    /// Run one transaction against the default slave address and wait for its
    /// outcome.
    ///
    /// For a read-from-server the PDU is sent as is, and the fetched values
    /// are delivered to the handler's `on_write`. For a write-to-server the
    /// data portion is filled in by the handler's `on_read`.
    pub async fn do_transaction(&self, request: Pdu) -> Result<(), RequestError> {
        self.do_transaction_to(self.slave_id, request).await
    }

    /// [`TransactionHandle::do_transaction`] with an explicit slave address.
    pub async fn do_transaction_to(
        &self,
        slave_id: SlaveId,
        request: Pdu,
    ) -> Result<(), RequestError> {
        let rx = self.start_transaction(slave_id, request).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Shutdown),
        }
    }

    /// Queue a transaction without waiting; the receiver resolves with its
    /// outcome.
    pub async fn start_transaction(
        &self,
        slave_id: SlaveId,
        request: Pdu,
    ) -> Result<oneshot::Receiver<Result<(), RequestError>>, RequestError> {
        let (reply, rx) = oneshot::channel();
        let transaction = Transaction {
            frame: Frame::wrap(slave_id, &request),
            reply,
        };
        self.tx
            .send(Event::Start(transaction))
            .await
            .map_err(|_| RequestError::Shutdown)?;
        Ok(rx)
    }

    /// Run a batch of transactions in order, stopping at the first failure.
    /// Returns the number completed, or the failing index and its error.
    pub async fn do_transactions(
        &self,
        slave_id: SlaveId,
        requests: Vec<Pdu>,
    ) -> Result<usize, crate::error::BatchError> {
        for (index, request) in requests.iter().enumerate() {
            if let Err(source) = self.do_transaction_to(slave_id, request.clone()).await {
                return Err(crate::error::BatchError { index, source });
            }
        }
        Ok(requests.len())
    }

    /// Ask the engine to return from `serve`.
    pub async fn close(&self) {
        let _ = self.tx.send(Event::Shutdown).await;
    }
}

/// Split one logical operation into per-packet request headers obeying the
/// function code's packet-size cap. The concatenated headers cover exactly
/// `[address, address + quantity)`.
pub fn make_pdu_request_headers(
    fc: FunctionCode,
    address: u16,
    quantity: u16,
) -> Result<Vec<Pdu>, InvalidRequest> {
    make_pdu_request_headers_sized(fc, address, quantity, fc.max_per_packet())
}

/// [`make_pdu_request_headers`] with an explicit per-packet cap, such as one
/// computed by [`FunctionCode::max_per_packet_sized`].
pub fn make_pdu_request_headers_sized(
    fc: FunctionCode,
    address: u16,
    quantity: u16,
    max_per_packet: u16,
) -> Result<Vec<Pdu>, InvalidRequest> {
    if address as u32 + quantity as u32 > limits::ADDRESS_SPACE {
        return Err(InvalidRequest::AddressOverflow(address, quantity));
    }
    let mut headers = Vec::new();
    let mut address = address;
    let mut remaining = quantity;
    while remaining > 0 {
        let count = remaining.min(max_per_packet);
        headers.push(fc.make_request_header(address, count)?);
        address = address.wrapping_add(count);
        remaining -= count;
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_cover_the_full_range() {
        let headers =
            make_pdu_request_headers(FunctionCode::ReadHoldingRegisters, 1000, 517).unwrap();
        let mut next = 1000u16;
        let mut total = 0u32;
        for header in &headers {
            assert_eq!(header.address(), next);
            let count = header.request_count();
            assert!(count <= FunctionCode::ReadHoldingRegisters.max_per_packet());
            next = next.wrapping_add(count);
            total += count as u32;
        }
        assert_eq!(total, 517);
        assert_eq!(headers.len(), 5);
    }

    #[test]
    fn single_op_headers_split_to_one_each() {
        let headers = make_pdu_request_headers(FunctionCode::WriteSingleCoil, 5, 3).unwrap();
        assert_eq!(headers.len(), 3);
        for (i, header) in headers.iter().enumerate() {
            assert_eq!(header.address(), 5 + i as u16);
            assert_eq!(header.request_count(), 1);
        }
    }

    #[test]
    fn rejects_ranges_past_the_address_space() {
        assert!(make_pdu_request_headers(FunctionCode::ReadCoils, 0xFFFF, 2).is_err());
        // the full address space is reachable
        assert!(make_pdu_request_headers(FunctionCode::ReadCoils, 0xF000, 0x1000).is_ok());
    }

    #[test]
    fn sized_splitting_respects_the_cap() {
        let headers =
            make_pdu_request_headers_sized(FunctionCode::ReadHoldingRegisters, 0, 10, 4).unwrap();
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[2].request_count(), 2);
    }
}
