//! Hard-stop behaviour: a reader parked in a blocking socket read must be
//! gone almost immediately after `stop()`, with the interruption treated
//! as a normal termination.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chain::{Block, Chain, InQ, SyncEnvelope};
use netio::{NetFd, NetParms, Protocol};
use streams::args::{close_and_kick, FdArgs};
use streams::readers::socket_reader;

#[test]
fn hard_stop_unblocks_a_socket_reader() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // a peer that connects and then stays silent: the reader will park
    // inside a blocking read
    let _peer = TcpStream::connect(addr).unwrap();
    let (conn, _) = listener.accept().unwrap();

    let conn = Arc::new(std::sync::Mutex::new(Some(conn)));
    let mut c = Chain::new();
    let reader = {
        let conn = Arc::clone(&conn);
        c.add_producer(4, move || {
            let stream = conn.lock().unwrap().take().expect("single run");
            let np = NetParms {
                blocksize: 4096,
                slot_size: 4096,
                wire_size: 4096,
                ..NetParms::default()
            };
            FdArgs::new(NetFd::from_owned(stream.into(), Protocol::Tcp), np)
        }, socket_reader)
        .unwrap()
    };
    c.add_consumer(|| 0u64, |inq: &InQ<Block>, env: &SyncEnvelope<u64>| {
        while inq.pop().is_some() {
            *env.lock().user_mut() += 1;
        }
        Ok(())
    })
    .unwrap();
    c.register_cancel(&reader, close_and_kick).unwrap();

    c.run().unwrap();
    // give the reader time to reach the blocking read
    std::thread::sleep(Duration::from_millis(50));

    let t0 = Instant::now();
    c.stop();
    let took = t0.elapsed();

    assert!(
        took < Duration::from_millis(1000),
        "stop took {took:?}; the cancel hook failed to unblock the reader"
    );
    // EINTR/EBADF is the normal way out, not an error
    assert!(!c.broken(), "termination was misreported as a stage error");
}
