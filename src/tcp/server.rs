use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

use crate::common::pdu::Pdu;
use crate::common::phys::{self, PhysWriter};
use crate::constants::limits;
use crate::decode::DecodeLevel;
use crate::error::RequestError;
use crate::exception::ExceptionCode;
use crate::handler::ProtocolHandler;
use crate::tcp::frame::{format_mbap, MbapFrame, MbapReader};

/// Requests that a running [`TcpServer`] stop accepting connections.
#[derive(Clone)]
pub struct TcpShutdownHandle {
    tx: mpsc::Sender<()>,
}

impl TcpShutdownHandle {
    pub fn close(&self) {
        let _ = self.tx.try_send(());
    }
}

/// Server (slave) side engine for Modbus over TCP. Mirrors the RTU server
/// minus CRC and inter-frame timing: each accepted connection gets its own
/// session task, all sharing one handler. Unit ids are echoed rather than
/// filtered, and unit id 0 is never answered.
pub struct TcpServer {
    listener: TcpListener,
    over_size_support: bool,
    decode: DecodeLevel,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl TcpServer {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_decode(listener, DecodeLevel::nothing())
    }

    pub fn with_decode(listener: TcpListener, decode: DecodeLevel) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            listener,
            over_size_support: false,
            decode,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Accept multi-write requests sized by their quantity field rather than
    /// the declared byte count.
    pub fn set_over_size_support(&mut self, enabled: bool) {
        self.over_size_support = enabled;
    }

    /// A handle that makes `serve` return [`RequestError::Shutdown`].
    pub fn shutdown_handle(&self) -> TcpShutdownHandle {
        TcpShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections and serve requests until the listener fails or the
    /// shutdown handle fires.
    pub async fn serve<H>(mut self, handler: H) -> RequestError
    where
        H: ProtocolHandler + 'static,
    {
        let handler = Arc::new(Mutex::new(handler));
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown_rx.recv() => return RequestError::Shutdown,
                accepted = self.listener.accept() => accepted,
            };
            let (socket, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(err) => return err.into(),
            };
            tracing::info!("accepted connection from {}", peer);
            let session = Session {
                handler: handler.clone(),
                over_size_support: self.over_size_support,
                decode: self.decode,
            };
            tokio::spawn(async move {
                if let Err(err) = session.run(socket).await {
                    tracing::info!("session from {} ended: {}", peer, err);
                }
            });
        }
    }
}

struct Session<H> {
    handler: Arc<Mutex<H>>,
    over_size_support: bool,
    decode: DecodeLevel,
}

impl<H: ProtocolHandler> Session<H> {
    async fn run(&self, socket: TcpStream) -> Result<(), RequestError> {
        let (rx, tx) = phys::split(socket, self.decode.physical);
        let max_pdu = if self.over_size_support {
            limits::OVER_SIZE_MAX_RTU
        } else {
            limits::MAX_PDU_SIZE
        };
        let mut reader = MbapReader::new(rx, max_pdu);
        let mut writer = tx;
        loop {
            let frame = reader.read_frame().await?;
            self.respond(&mut writer, frame).await?;
        }
    }

    async fn respond(&self, writer: &mut PhysWriter, frame: MbapFrame) -> Result<(), RequestError> {
        let MbapFrame {
            tx_id,
            unit_id,
            pdu,
        } = frame;

        let reply = match self.answer(&pdu).await {
            Ok(reply) => reply,
            Err(code) => pdu.exception_reply(code),
        };
        if unit_id.is_broadcast() {
            // broadcasts are processed but never answered
            return Ok(());
        }
        writer
            .write(&format_mbap(tx_id, unit_id, &reply))
            .await
            .map_err(Into::into)
    }

    async fn answer(&self, pdu: &Pdu) -> Result<Pdu, ExceptionCode> {
        pdu.validate_request()?;
        let fc = pdu.function_code().ok_or(ExceptionCode::IllegalFunction)?;

        let mut handler = self.handler.lock().await;
        if fc.is_read_to_server() {
            let count = pdu.request_count();
            if count == 0 {
                return Err(ExceptionCode::IllegalDataValue);
            }
            if pdu.address() as u32 + count as u32 > limits::ADDRESS_SPACE {
                return Err(ExceptionCode::IllegalDataAddress);
            }
            match handler.on_read(pdu) {
                Ok(data) => Ok(pdu.make_read_reply(&data)),
                Err(err) => Err(err.to_exception()),
            }
        } else {
            let data = pdu.request_values(self.over_size_support)?;
            match handler.on_write(pdu, data) {
                Ok(()) => Ok(pdu.make_write_reply()),
                Err(err) => Err(err.to_exception()),
            }
        }
    }
}
