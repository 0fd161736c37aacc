use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::{BufMut, Bytes, BytesMut};
use http::{Method, Request, Response, Uri, Version, header};
use itertools::Itertools;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpStream, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream, native_tls::TlsConnector};

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);
const MAX_RESPONSE_HEADERS: usize = 64;

/// A TCP stream, optionally wrapped in TLS, depending on the URL scheme.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

macro_rules! dispatch {
    ($self:ident.$method:ident($($arg:expr),*)) => {
        match $self.get_mut() {
            Transport::Plain(s) => Pin::new(s).$method($($arg),*),
            Transport::Tls(s) => Pin::new(s.as_mut()).$method($($arg),*),
        }
    };
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        dispatch!(self.poll_read(cx, buf))
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        dispatch!(self.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        dispatch!(self.poll_shutdown(cx))
    }
}

/// `wss` and `https` need TLS, anything else is plain TCP.
pub fn wants_tls(uri: &Uri) -> bool {
    matches!(uri.scheme_str(), Some("wss" | "https"))
}

pub async fn connect(uri: &Uri, prefer_ipv6: bool) -> anyhow::Result<Transport> {
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name in {uri}"))?;
    // IPv6 literals keep their brackets in the URI
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let tls = wants_tls(uri);
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    trace!("connecting to ({host}, {port})");
    let stream = connect_happy_eyeballs(host, port, prefer_ipv6).await?;

    if tls {
        let connector = TokioTlsConnector::from(TlsConnector::new()?);
        Ok(Transport::Tls(Box::new(connector.connect(host, stream).await?)))
    } else {
        Ok(Transport::Plain(stream))
    }
}

async fn connect_happy_eyeballs(
    host: &str,
    port: u16,
    prefer_ipv6: bool,
) -> anyhow::Result<TcpStream> {
    let (v4, v6): (Vec<_>, Vec<_>) = lookup_host((host, port)).await?.partition(|a| a.is_ipv4());
    let (first, second) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };

    let mut attempts = JoinSet::new();
    let settle = |res: Result<io::Result<TcpStream>, tokio::task::JoinError>| match res {
        Ok(Ok(stream)) => {
            debug!(
                "connected to {}",
                stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "<unknown>".to_owned())
            );
            Some(stream)
        }
        Ok(Err(e)) => {
            trace!("connection attempt failed: {e}");
            None
        }
        Err(e) => {
            trace!("connection attempt aborted: {e}");
            None
        }
    };

    // start the next candidate whenever the running ones stay silent for a while
    for addr in first.into_iter().interleave(second) {
        attempts.spawn(TcpStream::connect(addr));
        while let Ok(Some(res)) =
            tokio::time::timeout(HAPPY_EYEBALLS_DELAY, attempts.join_next()).await
        {
            if let Some(stream) = settle(res) {
                return Ok(stream);
            }
        }
    }

    while let Some(res) = attempts.join_next().await {
        if let Some(stream) = settle(res) {
            return Ok(stream);
        }
    }

    anyhow::bail!("I/O error: all connection attempts to ({host}, {port}) failed")
}

/// Plain HTTP/1.1 GET with `Connection: close`, the body is read until EOF.
pub async fn get(url: &str, prefer_ipv6: bool) -> anyhow::Result<Response<Bytes>> {
    let uri: Uri = url.parse()?;
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name in {url}"))?;
    // userinfo never goes into the Host header
    let host = authority
        .as_str()
        .rsplit_once('@')
        .map_or(authority.as_str(), |(_, host)| host);

    let req = Request::builder()
        .method(Method::GET)
        .uri(&uri)
        .header(header::HOST, host)
        .header(header::CONNECTION, "close")
        .header(header::ACCEPT, "application/json")
        .header(header::ACCEPT_ENCODING, "identity")
        .body(Bytes::new())?;

    let mut stream = connect(&uri, prefer_ipv6).await?;
    stream.write_all(&encode_request(&req)).await?;
    stream.flush().await?;

    let mut buffer = BytesMut::with_capacity(256);
    while stream.read_buf(&mut buffer).await? != 0 {}
    trace!("response: {:?}", String::from_utf8_lossy(&buffer));

    parse_response(buffer.freeze())
}

fn encode_request(req: &Request<Bytes>) -> Bytes {
    let target = req.uri().path_and_query().map_or("/", |pq| pq.as_str());

    let mut buffer = BytesMut::with_capacity(128);
    buffer.put_slice(format!("{} {target} {:?}\r\n", req.method(), req.version()).as_bytes());
    for (name, value) in req.headers() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put_slice(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }
    buffer.put_slice(b"\r\n");
    buffer.put_slice(req.body());

    trace!("request: {:?}", String::from_utf8_lossy(&buffer));
    buffer.freeze()
}

fn parse_response(bytes: Bytes) -> anyhow::Result<Response<Bytes>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let httparse::Status::Complete(body_start) = resp.parse(&bytes)? else {
        anyhow::bail!("HTTP error: response is incomplete");
    };

    let mut builder = Response::builder()
        .status(resp.code.unwrap_or(200))
        .version(match resp.version {
            Some(0) => Version::HTTP_10,
            _ => Version::HTTP_11,
        });
    for h in resp.headers.iter() {
        builder = builder.header(h.name, h.value);
    }

    Ok(builder.body(bytes.slice(body_start..))?)
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[test]
    fn tls_follows_scheme() {
        assert!(wants_tls(&"wss://chat.example/ws".parse().unwrap()));
        assert!(wants_tls(&"https://chat.example/".parse().unwrap()));
        assert!(!wants_tls(&"ws://localhost/ws".parse().unwrap()));
        assert!(!wants_tls(&"http://localhost/".parse().unwrap()));
    }

    #[test]
    fn request_line_uses_origin_form() {
        let req = Request::builder()
            .uri("http://localhost:8080/health?x=1")
            .header(header::HOST, "localhost:8080")
            .body(Bytes::new())
            .unwrap();

        let raw = encode_request(&req);
        assert!(raw.starts_with(b"GET /health?x=1 HTTP/1.1\r\n"));
        assert!(raw.ends_with(b"host: localhost:8080\r\n\r\n"));
    }

    #[test]
    fn parses_complete_response_only() {
        let resp = parse_response(Bytes::from_static(
            b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\r\n{\"status\":\"healthy\"}",
        ))
        .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body().as_ref(), b"{\"status\":\"healthy\"}");

        assert!(parse_response(Bytes::from_static(b"HTTP/1.1 200 OK\r\ncontent-")).is_err());
    }

    #[tokio::test]
    async fn get_reads_until_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 4\r\n\r\nnope")
                .await
                .unwrap();
        });

        let resp = get(&format!("http://{addr}/missing"), false).await.unwrap();
        assert_eq!(resp.status(), 404);
        assert_eq!(resp.body().as_ref(), b"nope");
    }
}
