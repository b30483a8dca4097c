//! Control channel of the daemon.
//!
//! A UNIX stream socket accepts line-oriented commands; every response is
//! one or more lines followed by a lone `.` sentinel. The channel serves
//! the counter CSV dump and toggles the runtime verbosity flags.

use logflux_core::stats;
use logflux_core::verbosity::{self, Flag};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::thread;

/// Input lines longer than this (without a newline) close the connection.
const MAX_CONTROL_LINE_LENGTH: usize = 4096;

pub struct ControlServer {
    handle: thread::JoinHandle<()>,
}

impl ControlServer {
    /// Bind the control socket and serve connections on a background
    /// thread, one handler thread per connection.
    pub fn start(socket_path: &Path) -> io::Result<ControlServer> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        let handle = thread::Builder::new()
            .name("control-listener".into())
            .spawn(move || {
                for connection in listener.incoming() {
                    match connection {
                        Ok(stream) => {
                            if let Err(e) = thread::Builder::new()
                                .name("control-connection".into())
                                .spawn(move || {
                                    if let Err(e) = serve_connection(stream) {
                                        tracing::debug!(error = %e, "control connection closed");
                                    }
                                })
                            {
                                tracing::error!(error = %e, "cannot spawn control connection thread");
                            }
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "error accepting control connection");
                            break;
                        }
                    }
                }
            })?;
        Ok(ControlServer { handle })
    }

    pub fn join(self) {
        let _ = self.handle.join();
    }
}

fn serve_connection(stream: UnixStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut stream = stream;

    loop {
        let mut line = Vec::new();
        let consumed = reader
            .by_ref()
            .take(MAX_CONTROL_LINE_LENGTH as u64 + 1)
            .read_until(b'\n', &mut line)?;
        if consumed == 0 {
            return Ok(());
        }
        if line.last() != Some(&b'\n') {
            tracing::error!("too much data in the control socket input buffer");
            return Ok(());
        }
        line.pop();
        let command = String::from_utf8_lossy(&line).into_owned();
        if !dispatch_command(&mut stream, command.trim_end_matches('\r'))? {
            return Ok(());
        }
    }
}

fn send_reply(stream: &mut UnixStream, reply: &str) -> io::Result<()> {
    stream.write_all(reply.as_bytes())?;
    if !reply.ends_with('\n') {
        stream.write_all(b"\n")?;
    }
    stream.write_all(b".\n")?;
    stream.flush()
}

/// Returns false when the connection should close.
fn dispatch_command(stream: &mut UnixStream, command: &str) -> io::Result<bool> {
    let mut words = command.split(' ');
    match words.next() {
        Some("STATS") => {
            send_reply(stream, &stats::generate_csv())?;
            Ok(true)
        }
        Some("LOG") => {
            handle_log_command(stream, words.next(), words.next())?;
            Ok(true)
        }
        _ => {
            tracing::error!(command, "unknown command on the control channel");
            Ok(false)
        }
    }
}

fn handle_log_command(
    stream: &mut UnixStream,
    which: Option<&str>,
    setting: Option<&str>,
) -> io::Result<()> {
    let flag = match which {
        Some("DEBUG") => Some(Flag::Debug),
        Some("VERBOSE") => Some(Flag::Verbose),
        Some("TRACE") => Some(Flag::Trace),
        Some(_) => None,
        None => {
            return send_reply(
                stream,
                "Invalid arguments received, expected at least one argument",
            )
        }
    };

    let Some(flag) = flag else {
        return send_reply(stream, "Invalid arguments received");
    };

    match setting {
        Some(setting) => {
            let on = setting == "ON";
            if verbosity::set(flag, on) != on {
                tracing::info!(?flag, on, "verbosity changed");
            }
            send_reply(stream, "OK")
        }
        None => {
            let name = match flag {
                Flag::Debug => "DEBUG",
                Flag::Verbose => "VERBOSE",
                Flag::Trace => "TRACE",
            };
            send_reply(stream, &format!("{}={}", name, verbosity::get(flag) as u8))
        }
    }
}
