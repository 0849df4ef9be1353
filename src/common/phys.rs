use std::fmt::Write;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::decode::PhysDecodeLevel;

/// Read half of a physical layer with RX decode logging.
pub(crate) struct PhysReader {
    io: Box<dyn AsyncRead + Send + Unpin>,
    level: PhysDecodeLevel,
}

/// Write half of a physical layer with TX decode logging.
pub(crate) struct PhysWriter {
    io: Box<dyn AsyncWrite + Send + Unpin>,
    level: PhysDecodeLevel,
}

/// Split any duplex byte stream into logging halves.
pub(crate) fn split<T>(io: T, level: PhysDecodeLevel) -> (PhysReader, PhysWriter)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (rx, tx) = tokio::io::split(io);
    (
        PhysReader {
            io: Box::new(rx),
            level,
        },
        PhysWriter {
            io: Box::new(tx),
            level,
        },
    )
}

impl PhysReader {
    pub(crate) async fn read(&mut self, buffer: &mut [u8]) -> Result<usize, std::io::Error> {
        let length = self.io.read(buffer).await?;
        if length == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "stream closed",
            ));
        }
        if self.level.enabled() {
            if let Some(x) = buffer.get(0..length) {
                tracing::info!("PHYS RX - {}", PhysDisplay::new(self.level, x));
            }
        }
        Ok(length)
    }
}

impl PhysWriter {
    pub(crate) async fn write(&mut self, data: &[u8]) -> Result<(), std::io::Error> {
        if self.level.enabled() {
            tracing::info!("PHYS TX - {}", PhysDisplay::new(self.level, data));
        }
        self.io.write_all(data).await?;
        self.io.flush().await
    }
}

pub(crate) struct PhysDisplay<'a> {
    level: PhysDecodeLevel,
    data: &'a [u8],
}

impl<'a> PhysDisplay<'a> {
    pub(crate) fn new(level: PhysDecodeLevel, data: &'a [u8]) -> Self {
        PhysDisplay { level, data }
    }
}

impl std::fmt::Display for PhysDisplay<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} bytes", self.data.len())?;
        if self.level.data_enabled() {
            format_bytes(f, self.data)?;
        }
        Ok(())
    }
}

const BYTES_PER_DECODE_LINE: usize = 18;

pub(crate) fn format_bytes(f: &mut std::fmt::Formatter, bytes: &[u8]) -> std::fmt::Result {
    for chunk in bytes.chunks(BYTES_PER_DECODE_LINE) {
        writeln!(f)?;
        let mut first = true;
        for byte in chunk {
            if !first {
                f.write_char(' ')?;
            }
            first = false;
            write!(f, "{byte:02X?}")?;
        }
    }
    Ok(())
}
