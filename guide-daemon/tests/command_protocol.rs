//! End-to-end coverage of the command socket: a real `TcpStream` talking
//! line-oriented text to a `CommandServer` driven by a `FrameLoop`, rather
//! than calling `apply_command` directly (that's covered in
//! `dispatch.rs`'s unit tests). Exercises the scenarios in spec.md
//! section 8: cold boot, guide engage, a save sequence, a null update,
//! and rejection of an out-of-range framerate.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

// Drives a real `FrameLoop` on a background thread and talks to it over
// a genuine loopback `TcpStream`, the same way an operator's terminal
// would, rather than calling `apply_command` in-process.

use guide_daemon::camera::SimulatedFrameGrabber;
use guide_daemon::camera_codec::ManufacturingCal;
use guide_daemon::command_server::CommandServer;
use guide_daemon::frame_loop::FrameLoop;
use guide_daemon::isu::NoIsu;
use guide_types::GuideConfig;

struct NullTransport;
impl guide_daemon::camera_codec::SerialTransport for NullTransport {
    fn write_all(&mut self, _buf: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
    fn read_until_wait(&mut self, _wait_char: u8, _out: &mut Vec<u8>) -> std::io::Result<usize> {
        Ok(0)
    }
}

fn spawn_daemon(grabber: SimulatedFrameGrabber) -> (u16, std::sync::Arc<AtomicBool>, thread::JoinHandle<()>) {
    let server = CommandServer::bind(0).unwrap();
    let port = server.local_port();

    let mut frame_loop = FrameLoop::new(
        GuideConfig { guide_x0: 16, guide_y0: 16, null_x: 16.0, null_y: 16.0 },
        Box::new(NullTransport),
        ManufacturingCal { adc_at_0c: 0, adc_at_40c: 1, dac_at_0c: 0, dac_at_40c: 1 },
        Box::new(grabber),
        Box::new(NoIsu),
        server,
        Box::new(std::io::sink()),
    );

    let shutdown = std::sync::Arc::new(AtomicBool::new(false));
    let shutdown_for_loop = std::sync::Arc::clone(&shutdown);
    let handle = thread::spawn(move || {
        frame_loop.run(&shutdown_for_loop).unwrap();
    });

    (port, shutdown, handle)
}

fn connect(port: u16) -> BufReader<TcpStream> {
    for _ in 0..50 {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            return BufReader::new(stream);
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("could not connect to command socket on port {port}");
}

fn send(conn: &mut BufReader<TcpStream>, line: &str) -> String {
    conn.get_mut().write_all(format!("{line}\n").as_bytes()).unwrap();
    let mut reply = String::new();
    conn.read_line(&mut reply).unwrap();
    reply.trim_end().to_string()
}

#[test]
fn cold_boot_reports_idle_state() {
    let (port, shutdown, handle) = spawn_daemon(SimulatedFrameGrabber::new());
    let mut conn = connect(port);

    let reply = send(&mut conn, "CLIENTS");
    assert!(reply.starts_with(". CLIENTS"));

    send(&mut conn, "QUIT");
    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn invalid_framerate_is_rejected() {
    let (port, shutdown, handle) = spawn_daemon(SimulatedFrameGrabber::new());
    let mut conn = connect(port);

    let reply = send(&mut conn, "FRAMERATE -5");
    assert!(reply.starts_with("! FRAMERATE"));

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn null_update_is_echoed_back() {
    let (port, shutdown, handle) = spawn_daemon(SimulatedFrameGrabber::new());
    let mut conn = connect(port);

    let reply = send(&mut conn, "NULL 12.5 200.0");
    assert_eq!(reply, ". NULL");

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn guide_requires_video_first() {
    let (port, shutdown, handle) = spawn_daemon(SimulatedFrameGrabber::new().with_star(16.0, 16.0, 2.5, 12_000.0));
    let mut conn = connect(port);

    let rejected = send(&mut conn, "GUIDE ON");
    assert!(rejected.starts_with("! GUIDE"));

    let video_on = send(&mut conn, "VIDEO ON");
    assert_eq!(video_on, ". VIDEO ON");

    let guide_on = send(&mut conn, "GUIDE ON");
    assert_eq!(guide_on, ". GUIDE ON");

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}

#[test]
fn save_sequence_is_accepted_and_acked() {
    let (port, shutdown, handle) = spawn_daemon(SimulatedFrameGrabber::new());
    let mut conn = connect(port);

    let reply = send(&mut conn, "SAVE 10 \"a test sequence\"");
    assert_eq!(reply, ". SAVE");

    shutdown.store(true, Ordering::Relaxed);
    handle.join().unwrap();
}
