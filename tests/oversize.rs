//! Relaxed-size interop: multi-register writes beyond the standard 123
//! register cap, with frame length inferred from the quantity field.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use duobus::{
    CallbackHandler, DecodeLevel, Pdu, RtuClient, RtuServer, SerialContext, SerialOptions, SlaveId,
};

const SLAVE: SlaveId = SlaveId::new(0x33);
const BAUD: u32 = 1_000_000;

fn relaxed() -> SerialOptions {
    SerialOptions {
        over_size_support: true,
        over_size_max_rtu: 512,
        ..SerialOptions::default()
    }
}

#[tokio::test]
async fn oversize_write_of_200_registers() {
    let (client_io, server_io) = tokio::io::duplex(4096);

    let written: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    let mut server_handler = CallbackHandler {
        write_holding_registers: Some(Box::new(move |address, values| {
            assert_eq!(address, 0x0010);
            *sink.lock().unwrap() = values.to_vec();
            Ok(())
        })),
        ..Default::default()
    };
    let server_ctx =
        SerialContext::with_options(server_io, BAUD, relaxed(), DecodeLevel::nothing());
    let server = RtuServer::new(server_ctx, SLAVE);
    tokio::spawn(async move { server.serve(&mut server_handler).await });

    let values: Vec<u16> = (0..200).collect();
    let payload = values.clone();
    let mut client_handler = CallbackHandler {
        read_holding_registers: Some(Box::new(move |_, count| {
            assert_eq!(count, 200);
            Ok(payload.clone())
        })),
        ..Default::default()
    };
    let client_ctx =
        SerialContext::with_options(client_io, BAUD, relaxed(), DecodeLevel::nothing());
    let mut client = RtuClient::new(client_ctx, SLAVE);
    client.set_server_processing_time(Duration::from_millis(500));
    let handle = client.handle();
    tokio::spawn(async move { client.serve(&mut client_handler).await });

    // 200 registers exceed what make_request_header permits, so the relaxed
    // header is built by hand: the byte count field wraps past u8 and only
    // the quantity field describes the true length
    let quantity: u16 = 200;
    let request = Pdu::from(vec![
        0x10,
        0x00,
        0x10,
        (quantity >> 8) as u8,
        quantity as u8,
        (quantity as usize * 2) as u8,
    ]);
    handle.do_transaction(request).await.unwrap();

    assert_eq!(*written.lock().unwrap(), values);
}
