use crate::{
    connection::{Connection, Event},
    headers::Headers,
    types::{Config, StreamId},
};
use anyhow::Context as _;
use log::{debug, error, warn};
use std::{collections::HashMap, sync::Arc};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpListener,
};
use tokio_rustls::TlsAcceptor;

/// One fully-buffered request, assembled from stream events.
#[derive(Debug, Clone)]
pub struct ServerRequest {
    pub stream: StreamId,
    pub headers: Headers,
    pub body: Vec<u8>,
    pub trailers: Option<Headers>,
}

impl ServerRequest {
    pub fn method(&self) -> Option<&str> {
        self.headers.get(":method")
    }

    pub fn path(&self) -> Option<&str> {
        self.headers.get(":path")
    }
}

#[derive(Debug, Clone)]
pub struct ServerResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl ServerResponse {
    #[must_use]
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body(status: u16, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        let mut headers = Headers::new();
        headers.add("Content-Type", content_type);
        headers.add("Content-Length", body.len().to_string());
        Self {
            status,
            headers,
            body,
        }
    }
}

/// Application handler. Errors are caught at the dispatch boundary and
/// become a 500 on the affected stream; no error escapes the worker.
pub trait Service: Send + Sync + 'static {
    fn call(&self, request: ServerRequest) -> anyhow::Result<ServerResponse>;
}

impl<F> Service for F
where
    F: Fn(ServerRequest) -> anyhow::Result<ServerResponse> + Send + Sync + 'static,
{
    fn call(&self, request: ServerRequest) -> anyhow::Result<ServerResponse> {
        self(request)
    }
}

/// Accept loop for cleartext connections (HTTP/1.x, h2c, prior
/// knowledge). Each connection gets its own task, which is the only
/// owner of its protocol state.
pub async fn serve(listener: TcpListener, service: Arc<dyn Service>) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!("connection from {peer}");
        let service = service.clone();
        tokio::spawn(async move {
            let conn = Connection::new(Config::default());
            if let Err(err) = drive(socket, conn, service).await {
                warn!("connection from {peer} ended: {err:#}");
            }
        });
    }
}

/// Accept loop behind TLS. The negotiated ALPN protocol (`h2` or
/// `http/1.1`) is handed to the state machine before any bytes flow.
pub async fn serve_tls(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    service: Arc<dyn Service>,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let service = service.clone();
        tokio::spawn(async move {
            let stream = match acceptor.accept(socket).await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("TLS accept from {peer} failed: {err}");
                    return;
                }
            };
            let mut conn = Connection::new(Config::default());
            let alpn = stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
            conn.security_established(alpn.as_deref());
            if let Err(err) = drive(stream, conn, service).await {
                warn!("connection from {peer} ended: {err:#}");
            }
        });
    }
}

async fn drive<IO>(mut io: IO, mut conn: Connection, service: Arc<dyn Service>) -> anyhow::Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let mut pending: HashMap<StreamId, ServerRequest> = HashMap::new();
    let mut buf = [0u8; 8192];
    loop {
        flush(&mut io, &mut conn).await?;
        if conn.wants_close() {
            io.shutdown().await.ok();
            return Ok(());
        }
        if conn.is_closed() {
            return Ok(());
        }
        let n = io.read(&mut buf).await.context("socket read")?;
        if n == 0 {
            conn.disconnected();
            flush(&mut io, &mut conn).await.ok();
            return Ok(());
        }
        for event in conn.receive(&buf[..n]) {
            match event {
                Event::Headers {
                    stream, headers, ..
                } => {
                    pending.insert(
                        stream,
                        ServerRequest {
                            stream,
                            headers,
                            body: Vec::new(),
                            trailers: None,
                        },
                    );
                }
                Event::Body { stream, data } => {
                    if let Some(request) = pending.get_mut(&stream) {
                        request.body.extend_from_slice(&data);
                    }
                }
                Event::Trailers { stream, headers } => {
                    if let Some(request) = pending.get_mut(&stream) {
                        request.trailers = Some(headers);
                    }
                }
                Event::End { stream } => {
                    if let Some(request) = pending.remove(&stream) {
                        dispatch(&mut conn, request, service.as_ref());
                    }
                }
                Event::Reset { stream, .. } => {
                    pending.remove(&stream);
                }
                Event::GoAway { .. } | Event::WebSocketData { .. } => {}
            }
        }
    }
}

fn dispatch(conn: &mut Connection, request: ServerRequest, service: &dyn Service) {
    let stream = request.stream;
    match service.call(request) {
        Ok(response) => {
            if let Ok(mut handle) = conn.respond(stream) {
                handle.status(response.status).headers(&response.headers);
                if !response.body.is_empty() {
                    handle.start_body().body(&response.body);
                }
                handle.complete();
            }
        }
        Err(err) => {
            error!("handler failed on stream {stream}: {err:#}");
            let _ = conn.send_error(stream, 500);
        }
    }
}

async fn flush<IO>(io: &mut IO, conn: &mut Connection) -> anyhow::Result<()>
where
    IO: AsyncWrite + Unpin,
{
    while let Some(bytes) = conn.take_output() {
        io.write_all(&bytes).await.context("socket write")?;
    }
    io.flush().await.context("socket flush")?;
    Ok(())
}
