//! Bidirectional byte pump for protocol-upgraded connections (attach,
//! exec, build-stream) once the daemon has replied `101 Switching
//! Protocols`.

use std::io::{self, Read, Write};
use std::thread;

fn copy_until_closed<R: Read, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n])?;
        writer.flush()?;
    }
}

/// Pump bytes in both directions until either side closes. Each side
/// is passed as an already `try_clone`-split `(reader, writer)` pair
/// — `TcpStream` and `UnixStream` both support cheap duplication,
/// which is how the proxy obtains these from one accepted connection.
///
/// `client_leftover`/`upstream_leftover` are bytes already pulled off
/// the wire into an HTTP connection's internal buffer (via
/// [`trustproxy_http1::Connection::into_parts`]) before the upgrade
/// was recognized; they're written through before either side starts
/// reading fresh bytes, so nothing sent right after the `101` is lost.
pub fn pump_split<CR, CW, UR, UW>(
    mut client_read: CR,
    mut client_write: CW,
    mut upstream_read: UR,
    mut upstream_write: UW,
    client_leftover: Vec<u8>,
    upstream_leftover: Vec<u8>,
) where
    CR: Read + Send + 'static,
    CW: Write + Send + 'static,
    UR: Read + Send + 'static,
    UW: Write + Send + 'static,
{
    let to_upstream = thread::spawn(move || {
        if !client_leftover.is_empty() && upstream_write.write_all(&client_leftover).is_err() {
            return;
        }
        let _ = copy_until_closed(&mut client_read, &mut upstream_write);
    });
    let to_client = thread::spawn(move || {
        if !upstream_leftover.is_empty() && client_write.write_all(&upstream_leftover).is_err() {
            return;
        }
        let _ = copy_until_closed(&mut upstream_read, &mut client_write);
    });

    let _ = to_upstream.join();
    let _ = to_client.join();
}
