//! Hot-standby behavior over an emulated shared bus: takeover after missed
//! turns, yielding to the primary, and peer-reply harvesting between paired
//! clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duobus::{
    CallbackHandler, FailoverConn, FailoverMonitor, FailoverRtuClient, FailoverTimings,
    FunctionCode, RtuClient, RtuServer, SerialContext, SlaveId,
};

mod support;

const SLAVE: SlaveId = SlaveId::new(0x77);
const BAUD: u32 = 1_000_000;

fn timings(misses_max: u32) -> FailoverTimings {
    FailoverTimings {
        secondary_delay: Duration::from_millis(20),
        miss_delay: Duration::from_millis(40),
        primary_disconnect_delay: Duration::from_secs(10),
        primary_force_back_delay: Duration::from_secs(60),
        misses_max,
    }
}

/// Spawn a failover server whose holding registers are `base + address`.
/// Returns its monitor and the count of reads it has served.
fn spawn_server(
    io: tokio::io::DuplexStream,
    is_failover: bool,
    base: u16,
) -> (FailoverMonitor, Arc<AtomicUsize>) {
    let reads = Arc::new(AtomicUsize::new(0));
    let reads_counter = reads.clone();
    let mut handler = CallbackHandler {
        read_holding_registers: Some(Box::new(move |address, count| {
            reads_counter.fetch_add(1, Ordering::Relaxed);
            Ok((0..count).map(|i| base + address + i).collect())
        })),
        ..Default::default()
    };
    let ctx = SerialContext::new(io, BAUD);
    let misses_max = if is_failover { 5 } else { 3 };
    let conn = FailoverConn::with_timings(ctx, is_failover, timings(misses_max));
    let monitor = conn.monitor();
    let server = RtuServer::new_failover(conn, SLAVE);
    tokio::spawn(async move { server.serve(&mut handler).await });
    (monitor, reads)
}

#[tokio::test]
async fn failover_server_takes_over_and_yields() {
    let (mut endpoints, plugs) = support::bus(3);
    let client_io = endpoints.pop().unwrap();
    let failover_io = endpoints.pop().unwrap();
    let primary_io = endpoints.pop().unwrap();

    let (primary, primary_reads) = spawn_server(primary_io, false, 0x1000);
    let (failover, _failover_reads) = spawn_server(failover_io, true, 0x2000);

    let received: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    let mut handler = CallbackHandler {
        write_holding_registers: Some(Box::new(move |_, values| {
            *sink.lock().unwrap() = values.to_vec();
            Ok(())
        })),
        ..Default::default()
    };
    let mut client = RtuClient::new(SerialContext::new(client_io, BAUD), SLAVE);
    client.set_server_processing_time(Duration::from_millis(150));
    let handle = client.handle();
    tokio::spawn(async move { client.serve(&mut handler).await });

    let request = || {
        FunctionCode::ReadHoldingRegisters
            .make_request_header(2, 1)
            .unwrap()
    };
    let transact_until_ok = |label: &'static str| {
        let handle = handle.clone();
        let primary = primary.clone();
        let failover = failover.clone();
        async move {
            for attempt in 1..=20 {
                // never both active at once
                assert!(
                    !(primary.is_active() && failover.is_active()),
                    "both peers active during {label}"
                );
                if handle.do_transaction(request()).await.is_ok() {
                    return attempt;
                }
            }
            panic!("no reply after 20 attempts during {label}");
        }
    };

    // both sides start passive; the primary promotes itself first and answers
    transact_until_ok("startup").await;
    assert!(primary.is_active());
    assert!(!failover.is_active());
    assert_eq!(received.lock().unwrap().as_slice(), &[0x1002]);
    assert!(primary_reads.load(Ordering::Relaxed) > 0);

    // a healthy active primary answers every request
    for _ in 0..3 {
        handle.do_transaction(request()).await.unwrap();
    }

    // silence the primary; the failover counts its misses and takes over
    plugs[0].unplug();
    transact_until_ok("takeover").await;
    assert!(failover.is_active());
    assert_eq!(received.lock().unwrap().as_slice(), &[0x2002]);

    // once active, the failover answers on the first try
    handle.do_transaction(request()).await.unwrap();
}

#[tokio::test]
async fn paired_clients_share_harvested_values() {
    let (mut endpoints, _plugs) = support::bus(3);
    let server_io = endpoints.pop().unwrap();
    let failover_io = endpoints.pop().unwrap();
    let primary_io = endpoints.pop().unwrap();

    // a plain server backing known register values
    let mut server_handler = CallbackHandler {
        read_holding_registers: Some(Box::new(|address, count| {
            Ok((0..count).map(|i| 0x4B00 + address + i).collect())
        })),
        ..Default::default()
    };
    let server = RtuServer::new(SerialContext::new(server_io, BAUD), SLAVE);
    tokio::spawn(async move { server.serve(&mut server_handler).await });

    // the primary client transacts; its fetched values land here
    let primary_values: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(vec![0; 16]));
    let sink = primary_values.clone();
    let mut primary_handler = CallbackHandler {
        write_holding_registers: Some(Box::new(move |address, values| {
            sink.lock().unwrap()[address as usize..address as usize + values.len()]
                .copy_from_slice(values);
            Ok(())
        })),
        ..Default::default()
    };
    let primary_conn = FailoverConn::with_timings(
        SerialContext::new(primary_io, BAUD),
        false,
        timings(3),
    );
    let primary_monitor = primary_conn.monitor();
    let mut primary = FailoverRtuClient::new(primary_conn, SLAVE);
    primary.set_server_processing_time(Duration::from_millis(150));
    let primary_handle = primary.handle();
    tokio::spawn(async move { primary.serve(&mut primary_handler).await });

    // the failover client only listens, harvesting peer replies
    let harvested: Arc<Mutex<Vec<u16>>> = Arc::new(Mutex::new(vec![0; 16]));
    let sink = harvested.clone();
    let mut failover_handler = CallbackHandler {
        write_holding_registers: Some(Box::new(move |address, values| {
            sink.lock().unwrap()[address as usize..address as usize + values.len()]
                .copy_from_slice(values);
            Ok(())
        })),
        ..Default::default()
    };
    let failover_conn = FailoverConn::with_timings(
        SerialContext::new(failover_io, BAUD),
        true,
        timings(5),
    );
    let failover_monitor = failover_conn.monitor();
    let mut failover = FailoverRtuClient::new(failover_conn, SLAVE);
    failover.set_server_processing_time(Duration::from_millis(150));
    let failover_handle = failover.handle();
    tokio::spawn(async move { failover.serve(&mut failover_handler).await });

    let request = FunctionCode::ReadHoldingRegisters
        .make_request_header(4, 2)
        .unwrap();

    // a passive primary acknowledges without transmitting until its misses
    // promote it; keep going until real replies flow
    for _ in 0..12 {
        primary_handle.do_transaction(request.clone()).await.unwrap();
        if primary_values.lock().unwrap()[4] != 0 {
            break;
        }
    }
    assert!(primary_monitor.is_active());
    assert_eq!(&primary_values.lock().unwrap()[4..6], &[0x4B04, 0x4B05]);

    // the failover client saw the same transaction on the bus and mirrored it
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(&harvested.lock().unwrap()[4..6], &[0x4B04, 0x4B05]);
    assert!(!failover_monitor.is_active());

    // while the primary is alive, the failover's own transactions are
    // swallowed: acknowledged as success without reaching the server
    failover_handle.do_transaction(request.clone()).await.unwrap();
    assert!(!failover_monitor.is_active());
}
