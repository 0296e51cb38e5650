//! Non-destructively peek the SNI `ServerName` out of a raw TLS
//! ClientHello so a MITM proxy can route by SNI without terminating
//! the handshake itself.
//!
//! [`peek`] reads the first TLS record off a stream, parses it as a
//! ClientHello, and hands back a [`PeekedStream`] that replays the
//! bytes it consumed before reading anything further from the
//! underlying stream. The caller sees a stream byte-identical to the
//! original.

use std::io::{self, Cursor, Read};

use anyhow::{Context, Result, bail};

const HANDSHAKE_CONTENT_TYPE: u8 = 0x16;
const CLIENT_HELLO_MSG_TYPE: u8 = 0x01;
const SNI_EXTENSION_TYPE: u16 = 0x0000;
const SNI_HOST_NAME_ENTRY_TYPE: u8 = 0x00;

/// Information extracted from a ClientHello. Only the SNI is exposed
/// today; more fields (ALPN, supported versions) could be added
/// without breaking callers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    pub server_name: Option<String>,
}

/// A stream that replays a captured prefix before continuing to read
/// from the wrapped stream. Produced by [`peek`].
pub struct PeekedStream<S> {
    prefix: Cursor<Vec<u8>>,
    inner: S,
}

impl<S: Read> Read for PeekedStream<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if (self.prefix.position() as usize) < self.prefix.get_ref().len() {
            let n = self.prefix.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
        }
        self.inner.read(buf)
    }
}

impl<S: io::Write> io::Write for PeekedStream<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<S> PeekedStream<S> {
    /// Consume the wrapper, returning the underlying stream. Only safe
    /// to call before any bytes have been read through the wrapper.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            bail!("tls: truncated handshake message");
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }
}

/// Read the first TLS record from `stream` without losing any bytes,
/// and parse it as a ClientHello.
///
/// Returns an error containing `tls: first record does not look like
/// a TLS handshake` if the first byte isn't a TLS handshake record.
pub fn peek<S: Read>(mut stream: S) -> Result<(PeekedStream<S>, ClientHelloInfo)> {
    let mut captured = Vec::with_capacity(512);

    let mut record_header = [0u8; 5];
    stream
        .read_exact(&mut record_header)
        .context("tls: failed to read record header")?;
    captured.extend_from_slice(&record_header);

    if record_header[0] != HANDSHAKE_CONTENT_TYPE {
        bail!("tls: first record does not look like a TLS handshake");
    }

    let record_len = u16::from_be_bytes([record_header[3], record_header[4]]) as usize;
    let mut record_body = vec![0u8; record_len];
    stream
        .read_exact(&mut record_body)
        .context("tls: failed to read handshake record body")?;
    captured.extend_from_slice(&record_body);

    let info = parse_client_hello(&record_body)?;

    Ok((
        PeekedStream {
            prefix: Cursor::new(captured),
            inner: stream,
        },
        info,
    ))
}

fn parse_client_hello(record_body: &[u8]) -> Result<ClientHelloInfo> {
    let mut r = Reader::new(record_body);

    let msg_type = r.u8().context("tls: missing handshake message type")?;
    if msg_type != CLIENT_HELLO_MSG_TYPE {
        bail!("tls: first handshake message is not a ClientHello");
    }
    let body_len = r.u24()? as usize;
    let body = r.take(body_len).context("tls: truncated ClientHello body")?;
    let mut b = Reader::new(body);

    let _client_version = b.u16()?;
    let _random = b.take(32)?;

    let session_id_len = b.u8()? as usize;
    b.take(session_id_len)?;

    let cipher_suites_len = b.u16()? as usize;
    b.take(cipher_suites_len)?;

    let compression_len = b.u8()? as usize;
    b.take(compression_len)?;

    let mut info = ClientHelloInfo::default();

    if b.remaining() < 2 {
        // No extensions block present (pre-TLS-1.0-style hello); SNI absent.
        return Ok(info);
    }

    let extensions_len = b.u16()? as usize;
    let extensions = b.take(extensions_len)?;
    let mut e = Reader::new(extensions);

    while e.remaining() >= 4 {
        let ext_type = e.u16()?;
        let ext_len = e.u16()? as usize;
        let ext_data = e.take(ext_len)?;

        if ext_type == SNI_EXTENSION_TYPE {
            info.server_name = parse_sni_extension(ext_data)?;
        }
    }

    Ok(info)
}

fn parse_sni_extension(data: &[u8]) -> Result<Option<String>> {
    let mut r = Reader::new(data);
    if r.remaining() < 2 {
        return Ok(None);
    }
    let list_len = r.u16()? as usize;
    let list = r.take(list_len)?;
    let mut l = Reader::new(list);

    while l.remaining() >= 3 {
        let entry_type = l.u8()?;
        let name_len = l.u16()? as usize;
        let name = l.take(name_len)?;
        if entry_type == SNI_HOST_NAME_ENTRY_TYPE {
            return Ok(Some(
                String::from_utf8(name.to_vec()).context("tls: SNI hostname is not UTF-8")?,
            ));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor as IoCursor;

    fn encode_client_hello(server_name: &str) -> Vec<u8> {
        let mut sni_host = Vec::new();
        sni_host.push(SNI_HOST_NAME_ENTRY_TYPE);
        sni_host.extend_from_slice(&(server_name.len() as u16).to_be_bytes());
        sni_host.extend_from_slice(server_name.as_bytes());

        let mut sni_list = Vec::new();
        sni_list.extend_from_slice(&(sni_host.len() as u16).to_be_bytes());
        sni_list.extend_from_slice(&sni_host);

        let mut sni_ext = Vec::new();
        sni_ext.extend_from_slice(&0u16.to_be_bytes()); // extension type: server_name
        sni_ext.extend_from_slice(&(sni_list.len() as u16).to_be_bytes());
        sni_ext.extend_from_slice(&sni_list);

        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes()); // client_version
        body.extend_from_slice(&[0u8; 32]); // random
        body.push(0); // session id len
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites len
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods len
        body.push(0);
        body.extend_from_slice(&(sni_ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&sni_ext);

        let mut handshake = Vec::new();
        handshake.push(CLIENT_HELLO_MSG_TYPE);
        let len = body.len() as u32;
        handshake.extend_from_slice(&len.to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = Vec::new();
        record.push(HANDSHAKE_CONTENT_TYPE);
        record.extend_from_slice(&0x0301u16.to_be_bytes());
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn peeks_sni() {
        let record = encode_client_hello("example.com");
        let stream = IoCursor::new(record);
        let (_peeked, info) = peek(stream).expect("peek");
        assert_eq!(info.server_name.as_deref(), Some("example.com"));
    }

    #[test]
    fn non_handshake_record_is_rejected() {
        let mut record = vec![0x17u8]; // application data, not handshake
        record.extend_from_slice(&[0x03, 0x03, 0x00, 0x01, 0xAA]);
        let stream = IoCursor::new(record);
        let err = peek(stream).expect_err("should reject");
        assert!(
            err.to_string()
                .contains("tls: first record does not look like a TLS handshake")
        );
    }

    #[test]
    fn peeked_stream_replays_bytes_identically() {
        let record = encode_client_hello("example.com");
        let original = record.clone();
        let stream = IoCursor::new(record);
        let (mut peeked, _info) = peek(stream).expect("peek");

        let mut replayed = Vec::new();
        peeked.read_to_end(&mut replayed).expect("read all");
        assert_eq!(replayed, original);
    }

    #[test]
    fn no_sni_extension_yields_none() {
        let mut body = Vec::new();
        body.extend_from_slice(&0x0303u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 32]);
        body.push(0);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1);
        body.push(0);
        body.extend_from_slice(&0u16.to_be_bytes()); // zero-length extensions

        let mut handshake = vec![CLIENT_HELLO_MSG_TYPE];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![HANDSHAKE_CONTENT_TYPE];
        record.extend_from_slice(&0x0301u16.to_be_bytes());
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        let (_peeked, info) = peek(IoCursor::new(record)).expect("peek");
        assert_eq!(info.server_name, None);
    }

    /// Full-fidelity check: run a real rustls handshake over an
    /// in-memory duplex pipe, peeking the server side first.
    #[test]
    fn handshake_still_succeeds_after_peek() {
        use std::sync::Arc;
        use std::thread;

        let (client_sock, server_sock) = std::os::unix::net::UnixStream::pair().expect("pair");

        let params = rcgen::generate_simple_self_signed(vec!["example.com".to_string()])
            .expect("self-signed cert");
        let cert_der = params.cert.der().clone();
        let key_der = params.signing_key.serialize_der();

        let server_thread = thread::spawn(move || {
            let (peeked, info) = peek(server_sock).expect("peek");
            assert_eq!(info.server_name.as_deref(), Some("example.com"));

            let key = rustls::pki_types::PrivateKeyDer::Pkcs8(key_der.into());
            let server_config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert_der.into()], key)
                .expect("server config");
            let mut conn =
                rustls::ServerConnection::new(Arc::new(server_config)).expect("server conn");
            let mut stream = rustls::Stream::new(&mut conn, &mut { peeked });
            let mut buf = [0u8; 16];
            let _ = std::io::Read::read(&mut stream, &mut buf);
        });

        let mut root_store = rustls::RootCertStore::empty();
        root_store.add(params.cert.der().clone()).expect("add root");
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();
        let server_name = rustls::pki_types::ServerName::try_from("example.com").unwrap();
        let mut client_conn =
            rustls::ClientConnection::new(Arc::new(client_config), server_name).expect("client conn");
        let mut client_stream = rustls::Stream::new(&mut client_conn, &mut { client_sock });
        let _ = std::io::Write::write_all(&mut client_stream, b"hi");

        server_thread.join().expect("server thread");
    }
}
