//! In-process serial bus emulation: every endpoint's writes are broadcast to
//! every other endpoint, the way a shared RS-485 pair behaves. Endpoints can
//! be disconnected mid-test to simulate a dead device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::Mutex;

/// Disconnect switch for one bus endpoint.
#[derive(Clone)]
pub struct Plug {
    unplugged: Arc<AtomicBool>,
}

impl Plug {
    pub fn unplug(&self) {
        self.unplugged.store(true, Ordering::Relaxed);
    }

    #[allow(dead_code)]
    pub fn replug(&self) {
        self.unplugged.store(false, Ordering::Relaxed);
    }
}

/// Create a broadcast bus with `n` endpoints. Returns one duplex stream per
/// endpoint plus its disconnect switch. Must run inside a tokio runtime.
pub fn bus(n: usize) -> (Vec<DuplexStream>, Vec<Plug>) {
    let mut endpoints = Vec::new();
    let mut readers = Vec::new();
    let mut writers = Vec::new();
    let mut plugs = Vec::new();

    for _ in 0..n {
        let (endpoint, bus_side) = tokio::io::duplex(4096);
        let (read, write) = tokio::io::split(bus_side);
        endpoints.push(endpoint);
        readers.push(read);
        writers.push(Arc::new(Mutex::new(write)));
        plugs.push(Plug {
            unplugged: Arc::new(AtomicBool::new(false)),
        });
    }

    let writers: Arc<Vec<Arc<Mutex<WriteHalf<DuplexStream>>>>> = Arc::new(writers);
    for (index, mut reader) in readers.into_iter().enumerate() {
        let writers = writers.clone();
        let plugs: Vec<Plug> = plugs.clone();
        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];
            loop {
                let count = match reader.read(&mut buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(count) => count,
                };
                if plugs[index].unplugged.load(Ordering::Relaxed) {
                    continue;
                }
                for (peer, writer) in writers.iter().enumerate() {
                    if peer == index || plugs[peer].unplugged.load(Ordering::Relaxed) {
                        continue;
                    }
                    let _ = writer.lock().await.write_all(&buffer[..count]).await;
                }
            }
        });
    }
    (endpoints, plugs)
}
