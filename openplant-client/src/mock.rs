//! In-process server speaking the OpenPlant framing, for tests.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use bytes::{Buf, BytesMut};
use openplant_protocol::frame::{heartbeat_record, DecodedFrame, FrameDecoder, FrameEncoder, ECHO_BYTE, MIN_PAGE_SIZE};
use openplant_protocol::login::{LoginMessage, LoginReply, ServerHello};
use openplant_protocol::{CompressMode, DecodedRequest, Request, Response};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const SCRAMBLE: [u8; 20] = *b"mock-scramble-000000";

/// What the server does in answer to a request.
pub(crate) enum MockAction {
    Send(Response),
    /// Sends a heartbeat record; the echo is expected before the next request.
    Heartbeat,
    /// Drops the connection.
    Close,
}

type Handler = dyn Fn(&DecodedRequest) -> Vec<MockAction> + Send + Sync;

struct MockState {
    password: String,
    handler: Box<Handler>,
    requests: Mutex<Vec<DecodedRequest>>,
    connections: AtomicUsize,
    echoes: AtomicUsize,
}

pub(crate) struct MockServer {
    addr: SocketAddr,
    state: Arc<MockState>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub(crate) async fn start(
        password: &str,
        handler: impl Fn(&DecodedRequest) -> Vec<MockAction> + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(MockState {
            password: password.to_string(),
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            echoes: AtomicUsize::new(0),
        });
        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, state).await {
                        tracing::debug!(error = %e, "mock connection ended");
                    }
                });
            }
        });
        Self { addr, state, task }
    }

    pub(crate) fn config(&self, user: &str, password: &str) -> ConnectionConfig {
        ConnectionConfig::new(self.addr.ip().to_string(), self.addr.port())
            .with_credentials(user, password)
            .with_request_timeout(Duration::from_secs(5))
    }

    pub(crate) fn requests(&self) -> Vec<DecodedRequest> {
        self.state.requests.lock().clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn echoes(&self) -> usize {
        self.state.echoes.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MockConn {
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    buf: BytesMut,
    decoder: FrameDecoder,
    encoder: FrameEncoder,
    pending_echoes: usize,
    state: Arc<MockState>,
}

impl MockConn {
    /// Reads one framed message; `None` when the client hung up.
    async fn read_message(&mut self) -> Result<Option<BytesMut>, ClientError> {
        let mut message = BytesMut::new();
        loop {
            while self.pending_echoes > 0 && !self.buf.is_empty() {
                assert_eq!(self.buf[0], ECHO_BYTE, "expected heartbeat echo");
                self.buf.advance(1);
                self.pending_echoes -= 1;
                self.state.echoes.fetch_add(1, Ordering::SeqCst);
            }
            if self.pending_echoes == 0 {
                match self.decoder.decode(&mut self.buf)? {
                    Some(DecodedFrame::Heartbeat(_)) => {
                        self.wr.write_all(&[ECHO_BYTE]).await?;
                        continue;
                    }
                    Some(DecodedFrame::Data { eof, payload, .. }) => {
                        message.extend_from_slice(&payload);
                        if eof {
                            return Ok(Some(message));
                        }
                        continue;
                    }
                    None => {}
                }
            }
            if self.rd.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn send(&mut self, response: &Response) -> Result<(), ClientError> {
        let mut body = Vec::new();
        response.encode(&mut body);
        let mut out = BytesMut::new();
        self.encoder.encode_message(&body, &mut out)?;
        self.wr.write_all(&out).await?;
        Ok(())
    }
}

async fn serve(stream: TcpStream, state: Arc<MockState>) -> Result<(), ClientError> {
    let session = state.connections.fetch_add(1, Ordering::SeqCst) as u32 + 1;
    let (rd, mut wr) = stream.into_split();
    let hello = ServerHello {
        info: "OpenPlant mock".to_string(),
        session,
        scramble: SCRAMBLE,
        version: 0x0005_0000,
    };
    wr.write_all(&hello.encode()).await?;

    let mut conn = MockConn {
        rd,
        wr,
        buf: BytesMut::new(),
        decoder: FrameDecoder::new(),
        encoder: FrameEncoder::new(MIN_PAGE_SIZE, CompressMode::Raw),
        pending_echoes: 0,
        state,
    };

    let Some(login) = conn.read_message().await? else {
        return Ok(());
    };
    let ok = LoginMessage::decode(&login)?.verify(&conn.state.password, &SCRAMBLE);
    let reply = LoginReply {
        peer: Ipv4Addr::LOCALHOST,
        err: if ok { 0 } else { -1 },
    };
    conn.wr.write_all(&reply.encode()).await?;
    if !ok {
        return Ok(());
    }

    while let Some(body) = conn.read_message().await? {
        let request = Request::decode(&body)?;
        conn.state.requests.lock().push(request.clone());
        for action in (conn.state.handler)(&request) {
            match action {
                MockAction::Send(response) => conn.send(&response).await?,
                MockAction::Heartbeat => {
                    conn.wr.write_all(&heartbeat_record()).await?;
                    conn.pending_echoes += 1;
                }
                MockAction::Close => return Ok(()),
            }
        }
    }
    Ok(())
}
