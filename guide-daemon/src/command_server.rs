//! Line-oriented TCP command protocol (spec.md section 4.4). A single
//! listening socket, polled for a bounded budget per frame-loop tick; no
//! async runtime, matching spec.md section 9's "explicit state machine,
//! not cooperative continuations" and section 5's two-suspension-point
//! model. The teacher's own TCP listener (`flydra2::model_server`) is
//! `tokio`-based, but that crate serves a streaming HTTP/SSE endpoint, not
//! a bounded-latency line protocol competing with a real-time loop for the
//! same thread -- std's nonblocking `TcpListener`/`TcpStream` is the right
//! tool here and is used the way `ci2`'s synchronous camera trait favors
//! plain blocking/nonblocking calls over async.

use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use chrono::Utc;
use guide_types::{ClientRecord, Command, CommandReply, StartExpArgs};

pub struct CommandServer {
    listener: TcpListener,
    connections: Vec<Connection>,
}

struct Connection {
    stream: TcpStream,
    record: ClientRecord,
    buf: Vec<u8>,
}

#[derive(Debug)]
pub enum PollOutcome {
    Continue,
    Shutdown,
}

impl CommandServer {
    pub fn bind(port: u16) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, connections: Vec::new() })
    }

    /// The port actually bound; useful when `bind(0)` let the OS pick one.
    pub fn local_port(&self) -> u16 {
        self.listener.local_addr().expect("listener is always bound").port()
    }

    fn accept_new(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if stream.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let remote_ip = match addr {
                        SocketAddr::V4(v4) => *v4.ip(),
                        SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
                    };
                    let record = ClientRecord {
                        remote_ip,
                        // Reverse DNS is out of scope here (no such
                        // collaborator is named in spec.md section 1); the
                        // dotted-quad stands in for the hostname.
                        hostname: remote_ip.to_string(),
                        connected_at: Utc::now(),
                    };
                    tracing::info!(ip = %remote_ip, "operator connected");
                    self.connections.push(Connection { stream, record, buf: Vec::new() });
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    /// Services the command socket for at most `budget`, invoking `apply`
    /// for each fully parsed command and writing its reply line back to
    /// the originating connection. Returns `Shutdown` if `SHUTDOWN` was
    /// received.
    pub fn poll(
        &mut self,
        budget: Duration,
        mut apply: impl FnMut(Command) -> CommandReply,
    ) -> PollOutcome {
        let deadline = Instant::now() + budget;
        self.accept_new();

        let mut outcome = PollOutcome::Continue;
        let mut dead: Vec<usize> = Vec::new();

        'conns: for (idx, conn) in self.connections.iter_mut().enumerate() {
            loop {
                if Instant::now() >= deadline {
                    break 'conns;
                }
                let mut chunk = [0u8; 256];
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        dead.push(idx);
                        break;
                    }
                    Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(_) => {
                        dead.push(idx);
                        break;
                    }
                }

                while let Some(pos) = conn.buf.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = conn.buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match parse_command(line) {
                        Ok(Command::Disconnect) => {
                            dead.push(idx);
                        }
                        Ok(Command::Shutdown) => {
                            let _ = writeln!(conn.stream, "{}", CommandReply::ok("SHUTDOWN").to_line());
                            outcome = PollOutcome::Shutdown;
                        }
                        Ok(cmd) => {
                            let reply = apply(cmd);
                            let _ = writeln!(conn.stream, "{}", reply.to_line());
                        }
                        Err((echo, msg)) => {
                            let _ = writeln!(conn.stream, "{}", CommandReply::err(echo, msg).to_line());
                        }
                    }
                }
            }
        }

        dead.sort_unstable();
        dead.dedup();
        for idx in dead.into_iter().rev() {
            self.connections.remove(idx);
        }

        outcome
    }

    pub fn client_records(&self) -> Vec<ClientRecord> {
        self.connections.iter().map(|c| c.record.clone()).collect()
    }
}

/// Splits a command line into whitespace-separated tokens, honoring
/// double-quoted strings (spec.md section 4.4).
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut s = String::new();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                s.push(c);
            }
            tokens.push(s);
        } else {
            let mut s = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                s.push(c);
                chars.next();
            }
            tokens.push(s);
        }
    }
    tokens
}

type ParseErr = (String, String);

fn parse_command(line: &str) -> Result<Command, ParseErr> {
    let tokens = tokenize(line);
    let Some(head) = tokens.first() else {
        return Err(("".into(), "empty command".into()));
    };
    let echo = head.to_uppercase();

    match echo.as_str() {
        "QUIT" | "BYE" | "EXIT" | "LOGOUT" => Ok(Command::Disconnect),
        "SHUTDOWN" => Ok(Command::Shutdown),
        "ENDEXP" => Ok(Command::EndExp),
        "CLIENTS" => Ok(Command::Clients),
        "TEMP" => Ok(Command::Temp),

        "FRAMERATE" | "EXPTIME" | "TEC" => {
            let value = match tokens.get(1) {
                None => None,
                Some(s) => Some(s.parse::<f64>().map_err(|_| {
                    (echo.clone(), format!("{s:?} is not a number"))
                })?),
            };
            Ok(match echo.as_str() {
                "FRAMERATE" => Command::FrameRate(value),
                "EXPTIME" => Command::ExpTime(value),
                _ => Command::Tec(value),
            })
        }

        "ROI" => match (tokens.get(1), tokens.get(2)) {
            (None, None) => Ok(Command::Roi(None)),
            (Some(x), Some(y)) => {
                let x: u32 = x.parse().map_err(|_| (echo.clone(), format!("{x:?} is not an integer")))?;
                let y: u32 = y.parse().map_err(|_| (echo.clone(), format!("{y:?} is not an integer")))?;
                Ok(Command::Roi(Some((x, y))))
            }
            _ => Err((echo, "ROI requires zero or two integer arguments".into())),
        },

        "NULL" => match (tokens.get(1), tokens.get(2)) {
            (None, None) => Ok(Command::Null(None)),
            (Some(x), Some(y)) => {
                let x: f64 = x.parse().map_err(|_| (echo.clone(), format!("{x:?} is not a number")))?;
                let y: f64 = y.parse().map_err(|_| (echo.clone(), format!("{y:?} is not a number")))?;
                Ok(Command::Null(Some((x, y))))
            }
            _ => Err((echo, "NULL requires zero or two numeric arguments".into())),
        },

        "VIDEO" | "GUIDE" | "ISU" => {
            let on = match tokens.get(1).map(|s| s.to_uppercase()) {
                Some(s) if s == "ON" => true,
                Some(s) if s == "OFF" => false,
                _ => return Err((echo, "expected ON or OFF".into())),
            };
            Ok(match echo.as_str() {
                "VIDEO" => Command::Video(on),
                "GUIDE" => Command::Guide(on),
                _ => Command::Isu(on),
            })
        }

        "SAVE" => {
            let n: u32 = tokens
                .get(1)
                .ok_or((echo.clone(), "SAVE requires a count".into()))?
                .parse()
                .map_err(|_| (echo.clone(), "count is not an integer".into()))?;
            if n as u64 > guide_types::MAX_SAVE_COUNT as u64 {
                return Err((echo, format!("count {n} exceeds maximum {}", guide_types::MAX_SAVE_COUNT)));
            }
            let comment = tokens.get(2).cloned().unwrap_or_default();
            Ok(Command::Save(n, comment))
        }

        "STARTEXP" => {
            let mut args = StartExpArgs::default();
            let mut got_filename = false;
            for tok in &tokens[1..] {
                let Some((key, value)) = tok.split_once('=') else {
                    return Err((echo, format!("{tok:?} is not a key=value pair")));
                };
                match key.to_uppercase().as_str() {
                    "FILENAME" => {
                        args.filename = value.to_string();
                        got_filename = true;
                    }
                    "RA" => args.ra = Some(value.to_string()),
                    "DEC" => args.dec = Some(value.to_string()),
                    "EQUINOX" => {
                        // See DESIGN.md: the original source stored OBJMAG=
                        // into the equinox field; that bug is not carried
                        // forward. EQUINOX= writes equinox, OBJMAG= writes
                        // objmag.
                        args.equinox = Some(value.parse().map_err(|_| {
                            (echo.clone(), format!("EQUINOX value {value:?} is not a number"))
                        })?);
                    }
                    "OBJMAG" => {
                        args.objmag = Some(value.parse().map_err(|_| {
                            (echo.clone(), format!("OBJMAG value {value:?} is not a number"))
                        })?);
                    }
                    other => return Err((echo, format!("unknown key {other:?}"))),
                }
            }
            if !got_filename {
                return Err((echo, "FILENAME= is required".into()));
            }
            Ok(Command::StartExp(args))
        }

        other => Err(("".into(), format!("unknown command {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_disconnect_aliases() {
        for word in ["QUIT", "bye", "Exit", "LOGOUT"] {
            assert_eq!(parse_command(word), Ok(Command::Disconnect));
        }
    }

    #[test]
    fn parses_framerate_query_and_set() {
        assert_eq!(parse_command("FRAMERATE"), Ok(Command::FrameRate(None)));
        assert_eq!(parse_command("framerate 50"), Ok(Command::FrameRate(Some(50.0))));
    }

    #[test]
    fn rejects_non_numeric_framerate() {
        assert!(parse_command("FRAMERATE abc").is_err());
    }

    #[test]
    fn parses_roi_and_null() {
        assert_eq!(parse_command("ROI 100 200"), Ok(Command::Roi(Some((100, 200)))));
        assert_eq!(parse_command("NULL 150 150"), Ok(Command::Null(Some((150.0, 150.0)))));
    }

    #[test]
    fn parses_video_guide_isu_toggles() {
        assert_eq!(parse_command("VIDEO ON"), Ok(Command::Video(true)));
        assert_eq!(parse_command("guide off"), Ok(Command::Guide(false)));
        assert_eq!(parse_command("ISU on"), Ok(Command::Isu(true)));
    }

    #[test]
    fn parses_save_with_quoted_comment() {
        assert_eq!(
            parse_command(r#"SAVE 3 "seq42""#),
            Ok(Command::Save(3, "seq42".into()))
        );
    }

    #[test]
    fn startexp_requires_filename() {
        assert!(parse_command("STARTEXP RA=10:00:00").is_err());
        let cmd = parse_command(r#"STARTEXP FILENAME=foo.fits EQUINOX=2000.0"#).unwrap();
        match cmd {
            Command::StartExp(args) => {
                assert_eq!(args.filename, "foo.fits");
                assert_eq!(args.equinox, Some(2000.0));
                assert_eq!(args.objmag, None);
            }
            _ => panic!("expected StartExp"),
        }
    }

    #[test]
    fn startexp_rejects_unknown_key() {
        assert!(parse_command("STARTEXP FILENAME=foo.fits BOGUS=1").is_err());
    }

    #[test]
    fn unknown_command_fails() {
        assert!(parse_command("FROB 1 2 3").is_err());
    }
}
