use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::common::function::FunctionCode;
use crate::common::pdu::{is_request_reply, Pdu};
use crate::common::phys::{self, PhysWriter};
use crate::constants::limits;
use crate::decode::DecodeLevel;
use crate::error::{AduParseError, BatchError, RequestError};
use crate::exception::ExceptionCode;
use crate::handler::ProtocolHandler;
use crate::tcp::frame::{format_mbap, MbapFrame, MbapReader};
use crate::types::SlaveId;

enum Event {
    Start(Transaction),
    Frame(MbapFrame),
    ReadError(RequestError),
    Shutdown,
}

struct Transaction {
    unit_id: SlaveId,
    request: Pdu,
    reply: oneshot::Sender<Result<(), RequestError>>,
}

impl Transaction {
    fn complete(self, result: Result<(), RequestError>) {
        let _ = self.reply.send(result);
    }
}

/// Client (master) side engine for Modbus over TCP. TCP is inherently framed,
/// so the transaction protocol is a plain request/response with an
/// incrementing MBAP transaction id; replies that fail to pair with the
/// outstanding request are still rejected.
pub struct TcpClient {
    reader: Option<MbapReader>,
    writer: PhysWriter,
    slave_id: SlaveId,
    response_timeout: Duration,
    tx_id: u16,
    tx: mpsc::Sender<Event>,
    rx: mpsc::Receiver<Event>,
}

impl TcpClient {
    /// Create a client over an established connection with the given default
    /// unit address.
    pub fn new<T>(io: T, slave_id: SlaveId) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_decode(io, slave_id, DecodeLevel::nothing())
    }

    /// [`TcpClient::new`] with decode logging.
    pub fn with_decode<T>(io: T, slave_id: SlaveId, decode: DecodeLevel) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = phys::split(io, decode.physical);
        let (tx, rx) = mpsc::channel(4);
        Self {
            reader: Some(MbapReader::new(reader, limits::MAX_PDU_SIZE)),
            writer,
            slave_id,
            response_timeout: Duration::from_secs(1),
            tx_id: 0,
            tx,
            rx,
        }
    }

    /// The time budget for the server to answer. Defaults to one second.
    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// A handle for starting transactions while `serve` runs.
    pub fn handle(&self) -> TcpTransactionHandle {
        TcpTransactionHandle {
            tx: self.tx.clone(),
            slave_id: self.slave_id,
        }
    }

    fn next_tx_id(&mut self) -> u16 {
        let id = self.tx_id;
        self.tx_id = self.tx_id.wrapping_add(1);
        id
    }

    /// Serve transactions until the connection fails or a handle calls
    /// `close`.
    pub async fn serve<H: ProtocolHandler>(mut self, handler: &mut H) -> RequestError {
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => return RequestError::Shutdown,
        };
        let events = self.tx.clone();
        tokio::spawn(async move {
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
                    Some(Event::Frame(frame)) => {
                        tracing::warn!("unsolicited frame with tx id {}", frame.tx_id);
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

    async fn run_transaction<H: ProtocolHandler>(
        &mut self,
        handler: &mut H,
        transaction: Transaction,
        pending: &mut VecDeque<Transaction>,
    ) -> Option<RequestError> {
        let Transaction {
            unit_id,
            mut request,
            reply,
        } = transaction;

        if let Some(fc) = request.function_code() {
            if fc.is_write_to_server() {
                let data = match handler.on_read(&request) {
                    Ok(data) => data,
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return None;
                    }
                };
                request = match request.make_write_request(&data) {
                    Ok(full) => full,
                    Err(err) => {
                        let _ = reply.send(Err(err.into()));
                        return None;
                    }
                };
            }
        }

        let tx_id = self.next_tx_id();
        let bytes = format_mbap(tx_id, unit_id, &request);
        if let Err(err) = self.writer.write(&bytes).await {
            let err = RequestError::from(err);
            let _ = reply.send(Err(err));
            return Some(err);
        }

        let transaction = Transaction {
            unit_id,
            request,
            reply,
        };
        if unit_id.is_broadcast() {
            transaction.complete(Ok(()));
            return None;
        }
        self.await_reply(handler, transaction, tx_id, pending).await
    }

    async fn await_reply<H: ProtocolHandler>(
        &mut self,
        handler: &mut H,
        transaction: Transaction,
        tx_id: u16,
        pending: &mut VecDeque<Transaction>,
    ) -> Option<RequestError> {
        let deadline = Instant::now() + self.response_timeout;
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

            if frame.tx_id != tx_id {
                tracing::warn!("expected tx id {}, received {}", tx_id, frame.tx_id);
                continue;
            }
            if frame.unit_id != transaction.unit_id {
                tracing::warn!("expected unit {}, received {}", transaction.unit_id, frame.unit_id);
                continue;
            }

            let reply = frame.pdu;
            let (exception, fc) = FunctionCode::separate_error(reply.raw_function());
            if exception && fc == transaction.request.raw_function() {
                handler.on_error(&transaction.request, &reply);
                transaction.complete(Err(RequestError::ServerException {
                    function: reply.raw_function(),
                    code: ExceptionCode::from_u8(
                        reply.as_bytes().get(1).copied().unwrap_or(0xFF),
                    ),
                }));
                return None;
            }
            if !is_request_reply(transaction.request.as_bytes(), reply.as_bytes(), false) {
                transaction.complete(Err(AduParseError::UnexpectedReply.into()));
                return None;
            }

            match transaction.request.function_code() {
                Some(fc) if fc.is_read_to_server() => {
                    let result = reply
                        .reply_values()
                        .map_err(RequestError::from)
                        .and_then(|values| {
                            handler
                                .on_write(&transaction.request, values)
                                .map_err(Into::into)
                        });
                    transaction.complete(result);
                }
                _ => transaction.complete(Ok(())),
            }
            return None;
        }
    }
}

/// Starts transactions on a [`TcpClient`] whose `serve` loop is running.
#[derive(Clone)]
pub struct TcpTransactionHandle {
    tx: mpsc::Sender<Event>,
    slave_id: SlaveId,
}

impl TcpTransactionHandle {
    /// Run one transaction against the default unit address and wait for its
    /// outcome.
    pub async fn do_transaction(&self, request: Pdu) -> Result<(), RequestError> {
        self.do_transaction_to(self.slave_id, request).await
    }

    /// [`TcpTransactionHandle::do_transaction`] with an explicit unit address.
    pub async fn do_transaction_to(
        &self,
        unit_id: SlaveId,
        request: Pdu,
    ) -> Result<(), RequestError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Event::Start(Transaction {
                unit_id,
                request,
                reply,
            }))
            .await
            .map_err(|_| RequestError::Shutdown)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Shutdown),
        }
    }

    /// Run a batch of transactions in order, stopping at the first failure.
    pub async fn do_transactions(
        &self,
        unit_id: SlaveId,
        requests: Vec<Pdu>,
    ) -> Result<usize, BatchError> {
        for (index, request) in requests.iter().enumerate() {
            if let Err(source) = self.do_transaction_to(unit_id, request.clone()).await {
                return Err(BatchError { index, source });
            }
        }
        Ok(requests.len())
    }

    /// Ask the engine to return from `serve`.
    pub async fn close(&self) {
        let _ = self.tx.send(Event::Shutdown).await;
    }
}
