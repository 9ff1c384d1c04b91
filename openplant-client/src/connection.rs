//! A single connection to an OpenPlant server.

use crate::dataset::DataSet;
use crate::error::ClientError;
use crate::subscription::{SubscribeOptions, Subscription};
use crate::transport::{FrameReader, FrameWriter, SharedWriter, DEFAULT_READ_CHUNK, MAX_READ_CHUNK, MIN_READ_CHUNK};
use bytes::{Bytes, BytesMut};
use openplant_protocol::frame::{clamp_page_size, heartbeat_record, DEFAULT_PAGE_SIZE};
use openplant_protocol::login::{build_login_message, LoginReply, ServerHello, HELLO_LEN, REPLY_LEN};
use openplant_protocol::{CompressMode, IndexKeys, MessageHead, ProtocolError, Request, ResponseHead, DEFAULT_PORT};
use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpStream;

pub(crate) type TcpFrameReader = FrameReader<ReadHalf<TcpStream>, WriteHalf<TcpStream>>;
pub(crate) type TcpFrameWriter = SharedWriter<WriteHalf<TcpStream>>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// TCP dial timeout.
    pub connect_timeout: Duration,
    /// Timeout applied to every read or write after the dial.
    pub request_timeout: Duration,
    /// Frame size including header, within `[1024, 65536]`.
    pub page_size: usize,
    /// Outbound compression.
    pub compress: CompressMode,
    /// Socket read chunk size.
    pub read_chunk_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", DEFAULT_PORT)
    }
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(60),
            page_size: DEFAULT_PAGE_SIZE,
            compress: CompressMode::Raw,
            read_chunk_size: DEFAULT_READ_CHUNK,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_page_size(mut self, size: usize) -> Self {
        self.page_size = clamp_page_size(size);
        self
    }

    pub fn with_compress_mode(mut self, mode: CompressMode) -> Self {
        self.compress = mode;
        self
    }

    pub fn with_read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = size.clamp(MIN_READ_CHUNK, MAX_READ_CHUNK);
        self
    }

    /// `host:port` as dialed.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Io {
    reader: TcpFrameReader,
    writer: TcpFrameWriter,
}

async fn timed<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ClientError::Timeout)?
}

/// An authenticated connection.
///
/// Operations are serialized by `&mut self`; a [`DataSet`] borrows the
/// connection until it is dropped or closed.
pub struct Connection {
    config: ConnectionConfig,
    io: Option<Io>,
    hello: Option<ServerHello>,
    peer: Option<Ipv4Addr>,
    next_reqid: i64,
    broken: bool,
    /// A response was only partly consumed.
    mid_message: bool,
    heartbeats_before: u64,
}

impl Connection {
    /// Dials and logs in.
    pub async fn connect(config: ConnectionConfig) -> Result<Self, ClientError> {
        let mut conn = Self {
            config,
            io: None,
            hello: None,
            peer: None,
            next_reqid: 1,
            broken: false,
            mid_message: false,
            heartbeats_before: 0,
        };
        conn.open().await?;
        Ok(conn)
    }

    async fn open(&mut self) -> Result<(), ClientError> {
        let addr = self.config.addr();
        tracing::debug!("Connecting to {}...", addr);
        let tcp = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                tracing::debug!("Connection timeout");
                ClientError::Timeout
            })??;
        tcp.set_nodelay(true).ok();

        let (r, w) = tokio::io::split(tcp);
        let writer = FrameWriter::new(w, self.config.page_size, self.config.compress).into_shared();
        let reader = FrameReader::new(r, writer.clone(), self.config.read_chunk_size);
        let mut io = Io { reader, writer };

        let (hello, reply) = timed(self.config.request_timeout, login(&mut io, &self.config)).await?;
        if !reply.is_ok() {
            tracing::debug!(code = reply.err, "login refused");
            return Err(ClientError::Auth { code: reply.err });
        }
        tracing::info!(server = %hello.info, session = hello.session, "connected to {}", addr);

        self.hello = Some(hello);
        self.peer = Some(reply.peer);
        self.io = Some(io);
        self.broken = false;
        self.mid_message = false;
        Ok(())
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// The server greeting of the current session.
    pub fn server_info(&self) -> Option<&ServerHello> {
        self.hello.as_ref()
    }

    /// This client's address as seen by the server.
    pub fn peer_addr(&self) -> Option<Ipv4Addr> {
        self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.io.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Heartbeats answered over the lifetime of this connection.
    pub fn heartbeats_answered(&self) -> u64 {
        self.heartbeats_before + self.io.as_ref().map_or(0, |io| io.reader.heartbeats_answered())
    }

    fn io(&mut self) -> Result<&mut Io, ClientError> {
        if self.broken {
            return Err(ClientError::Broken);
        }
        self.io.as_mut().ok_or(ClientError::NotConnected)
    }

    /// Marks the connection broken on transport and framing errors.
    fn check<T>(&mut self, res: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &res {
            if e.is_fatal() && !self.broken {
                tracing::warn!(error = %e, "connection broken");
                self.broken = true;
            }
        }
        res
    }

    /// Reads the next data frame of the current response.
    pub(crate) async fn read_frame(&mut self) -> Result<(Bytes, bool), ClientError> {
        let timeout = self.config.request_timeout;
        let io = self.io()?;
        let res = timed(timeout, io.reader.read_frame()).await;
        let (payload, eof) = self.check(res)?;
        self.mid_message = !eof;
        Ok((payload, eof))
    }

    /// Discards what is left of a partly read response.
    async fn drain(&mut self) -> Result<(), ClientError> {
        let mut skipped = 0usize;
        while self.mid_message {
            skipped += self.read_frame().await?.0.len();
        }
        if skipped > 0 {
            tracing::debug!(bytes = skipped, "drained unread response");
        }
        Ok(())
    }

    /// Stamps and sends a request.
    pub async fn send(&mut self, request: &mut Request) -> Result<(), ClientError> {
        self.drain().await?;
        if request.reqid().is_none() {
            request.set_reqid(self.next_reqid);
            self.next_reqid += 1;
        }
        tracing::debug!(
            reqid = request.reqid(),
            action = %request.action(),
            "sending request"
        );
        let timeout = self.config.request_timeout;
        let io = self.io()?;
        let res = timed(timeout, async { io.writer.lock().await.write_request(request).await }).await;
        self.check(res)
    }

    /// Reads frames until the response head is complete.
    ///
    /// Returns the head plus the already received bytes that follow it.
    async fn read_head(&mut self) -> Result<(ResponseHead, BytesMut, bool), ClientError> {
        let mut buf = BytesMut::new();
        loop {
            let (payload, eof) = self.read_frame().await?;
            buf.extend_from_slice(&payload);
            match MessageHead::decode(&buf) {
                Ok(Some((head, consumed))) => {
                    let _ = buf.split_to(consumed);
                    tracing::debug!(errno = head.errno(), reqid = head.reqid(), "response head");
                    return Ok((head, buf, eof));
                }
                Ok(None) if eof => {
                    let res = Err(ProtocolError::Incomplete { needed: 1 }.into());
                    return self.check(res);
                }
                Ok(None) => continue,
                Err(e) => {
                    self.broken = true;
                    return Err(e.into());
                }
            }
        }
    }

    fn server_error(head: &ResponseHead) -> Option<ClientError> {
        match head.errno() {
            0 => None,
            errno => Some(ClientError::Server {
                errno,
                message: head.error().to_string(),
            }),
        }
    }

    /// Sends a request and returns the response head; any rows are skipped.
    pub async fn execute(&mut self, mut request: Request) -> Result<ResponseHead, ClientError> {
        self.send(&mut request).await?;
        let (head, _, _) = self.read_head().await?;
        self.drain().await?;
        match Self::server_error(&head) {
            Some(e) => Err(e),
            None => Ok(head),
        }
    }

    /// Sends a request and opens a cursor over the result rows.
    pub async fn query(&mut self, mut request: Request) -> Result<DataSet<'_>, ClientError> {
        self.send(&mut request).await?;
        let (head, rest, eof) = self.read_head().await?;
        if let Some(e) = Self::server_error(&head) {
            self.drain().await?;
            return Err(e);
        }
        DataSet::new(self, head, rest, eof)
    }

    /// Sends a heartbeat record and waits for the echo byte.
    pub async fn alive(&mut self) -> Result<(), ClientError> {
        self.drain().await?;
        let timeout = self.config.request_timeout;
        let io = self.io()?;
        let res = timed(timeout, async {
            io.writer.lock().await.write_raw(&heartbeat_record()).await?;
            io.reader.read_echo().await
        })
        .await;
        self.check(res)
    }

    /// Re-dials with the same configuration and credentials.
    pub async fn reconnect(&mut self) -> Result<(), ClientError> {
        tracing::info!("reconnecting to {}", self.config.addr());
        self.shutdown().await;
        self.open().await
    }

    /// Changes the compression applied to subsequent frames.
    pub async fn set_compress_mode(&mut self, mode: CompressMode) {
        self.config.compress = mode;
        if let Some(io) = &self.io {
            io.writer.lock().await.set_mode(mode);
        }
    }

    /// Dials a new connection with the same configuration.
    pub async fn try_clone(&self) -> Result<Connection, ClientError> {
        Connection::connect(self.config.clone()).await
    }

    /// Starts a subscription on a dedicated clone of this connection.
    pub async fn subscribe(
        &self,
        table: &str,
        key: &str,
        keys: impl Into<IndexKeys>,
        options: SubscribeOptions,
    ) -> Result<Subscription, ClientError> {
        let conn = self.try_clone().await?;
        Subscription::start(conn, table, key, keys.into(), options).await
    }

    async fn shutdown(&mut self) {
        if let Some(io) = self.io.take() {
            self.heartbeats_before += io.reader.heartbeats_answered();
            let _ = io.writer.lock().await.shutdown().await;
        }
        self.mid_message = false;
    }

    /// Closes the connection.
    pub async fn close(&mut self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.shutdown().await;
        Ok(())
    }

    /// Hands the transport halves to a subscription pump.
    pub(crate) fn into_parts(mut self) -> Result<(TcpFrameReader, TcpFrameWriter), ClientError> {
        if self.broken {
            return Err(ClientError::Broken);
        }
        let io = self.io.take().ok_or(ClientError::NotConnected)?;
        Ok((io.reader, io.writer))
    }
}

async fn login(io: &mut Io, config: &ConnectionConfig) -> Result<(ServerHello, LoginReply), ClientError> {
    let greeting = io.reader.read_raw(HELLO_LEN).await?;
    let greeting: [u8; HELLO_LEN] = greeting[..]
        .try_into()
        .map_err(|_| ProtocolError::Incomplete { needed: HELLO_LEN })?;
    let hello = ServerHello::decode(&greeting);
    tracing::debug!(server = %hello.info, "received greeting");

    let message = build_login_message(&config.user, &config.password, &hello.scramble);
    io.writer.lock().await.write_message(&message).await?;

    let reply = io.reader.read_raw(REPLY_LEN).await?;
    let reply: [u8; REPLY_LEN] = reply[..]
        .try_into()
        .map_err(|_| ProtocolError::Incomplete { needed: REPLY_LEN })?;
    Ok((hello, LoginReply::decode(&reply)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAction, MockServer};
    use openplant_protocol::props::key;
    use openplant_protocol::{Action, Response, Table, VarType};

    fn points(n: i32) -> Table {
        let mut t = Table::new("Point");
        t.add_column("ID", VarType::Int32, 0).unwrap();
        t.add_column("GN", VarType::String, 0).unwrap();
        for i in 0..n {
            t.set_i32(0, 1024 + i).set_str(1, &format!("W3.N.P{i}"));
            t.bind_row().unwrap();
        }
        t
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::default();
        assert_eq!(config.port, 8200);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.page_size, 65536);
        assert_eq!(config.read_chunk_size, DEFAULT_READ_CHUNK);
    }

    #[test]
    fn test_config_clamping() {
        let config = ConnectionConfig::default()
            .with_page_size(10)
            .with_read_chunk_size(100);
        assert_eq!(config.page_size, 1024);
        assert_eq!(config.read_chunk_size, MIN_READ_CHUNK);

        let config = ConnectionConfig::default()
            .with_page_size(1 << 20)
            .with_read_chunk_size(10 * 1024 * 1024);
        assert_eq!(config.page_size, 65536);
        assert_eq!(config.read_chunk_size, MAX_READ_CHUNK);
    }

    #[tokio::test]
    async fn test_login() {
        let server = MockServer::start("secret", |_| vec![]).await;
        let conn = Connection::connect(server.config("sis", "secret")).await.unwrap();
        assert!(conn.is_connected());
        assert_eq!(conn.server_info().unwrap().info, "OpenPlant mock");
        assert_eq!(conn.peer_addr(), Some(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_login_refused() {
        let server = MockServer::start("secret", |_| vec![]).await;
        let err = Connection::connect(server.config("sis", "wrong")).await.err().unwrap();
        assert!(matches!(err, ClientError::Auth { code: -1 }));
    }

    #[tokio::test]
    async fn test_execute_and_reqid() {
        let server = MockServer::start("", |_| vec![MockAction::Send(Response::ok())]).await;
        let mut conn = Connection::connect(server.config("sis", "")).await.unwrap();
        conn.execute(Request::exec_sql("update x")).await.unwrap();
        conn.execute(Request::exec_sql("update y")).await.unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].head.reqid(), Some(1));
        assert_eq!(requests[1].head.reqid(), Some(2));
        assert_eq!(requests[1].head.props.get_str(key::SQL), Some("update y"));
    }

    #[tokio::test]
    async fn test_server_error() {
        let server = MockServer::start("", |_| {
            vec![MockAction::Send(Response::error(-105, "table not found"))]
        })
        .await;
        let mut conn = Connection::connect(server.config("sis", "")).await.unwrap();
        let err = conn.query(Request::select("Nope")).await.err().unwrap();
        assert!(matches!(err, ClientError::Server { errno: -105, .. }));
        assert!(!conn.is_broken());
    }

    #[tokio::test]
    async fn test_query_rows_across_frames() {
        let server = MockServer::start("", |_| {
            vec![MockAction::Send(Response::ok().with_table(points(500)).with_page_rows(64))]
        })
        .await;
        let config = server.config("sis", "").with_page_size(1024);
        let mut conn = Connection::connect(config).await.unwrap();

        let mut ds = conn.query(Request::select("Point")).await.unwrap();
        let mut n = 0;
        while ds.next().await.unwrap() {
            assert_eq!(ds.get_i32(0).unwrap(), 1024 + n);
            n += 1;
        }
        assert_eq!(n, 500);
        assert!(!ds.next().await.unwrap());
        ds.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_undrained_dataset_is_skipped() {
        let server = MockServer::start("", |req| {
            let n = if req.head.action() == Some(Action::Select) { 300 } else { 1 };
            vec![MockAction::Send(Response::ok().with_table(points(n)).with_page_rows(10))]
        })
        .await;
        let config = server.config("sis", "").with_page_size(1024);
        let mut conn = Connection::connect(config).await.unwrap();
        {
            let mut ds = conn.query(Request::select("Point")).await.unwrap();
            assert!(ds.next().await.unwrap());
        }
        let rs = conn
            .query(Request::exec_sql("select * from Point limit 1"))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(rs.rows.len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_mid_stream() {
        let server = MockServer::start("", |_| {
            vec![
                MockAction::Heartbeat,
                MockAction::Send(Response::ok().with_table(points(3))),
            ]
        })
        .await;
        let mut conn = Connection::connect(server.config("sis", "")).await.unwrap();
        let rs = conn.query(Request::select("Point")).await.unwrap().collect().await.unwrap();
        assert_eq!(rs.rows.len(), 3);
        assert_eq!(conn.heartbeats_answered(), 1);

        conn.execute(Request::exec_sql("select 1")).await.unwrap();
        assert_eq!(server.echoes(), 1);
    }

    #[tokio::test]
    async fn test_alive_and_compressed_requests() {
        let server = MockServer::start("", |_| vec![MockAction::Send(Response::ok())]).await;
        let mut conn = Connection::connect(server.config("sis", "")).await.unwrap();
        conn.alive().await.unwrap();

        conn.set_compress_mode(CompressMode::Lz4Frame).await;
        let sql = format!("select * from Realtime where GN in ({})", "'W3.N.P1',".repeat(200));
        conn.execute(Request::exec_sql(&sql)).await.unwrap();
        assert_eq!(server.requests()[0].head.props.get_str(key::SQL), Some(sql.as_str()));
    }

    #[tokio::test]
    async fn test_broken_until_reconnect() {
        let server = MockServer::start("", |req| {
            if req.head.props.get_str(key::SQL) == Some("crash") {
                vec![MockAction::Close]
            } else {
                vec![MockAction::Send(Response::ok())]
            }
        })
        .await;
        let mut conn = Connection::connect(server.config("sis", "")).await.unwrap();
        let err = conn.execute(Request::exec_sql("crash")).await.err().unwrap();
        assert!(err.is_fatal());
        assert!(conn.is_broken());
        assert!(matches!(
            conn.execute(Request::exec_sql("ok")).await,
            Err(ClientError::Broken)
        ));

        conn.reconnect().await.unwrap();
        assert!(!conn.is_broken());
        conn.execute(Request::exec_sql("ok")).await.unwrap();
        assert_eq!(server.connections(), 2);
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let server = MockServer::start("", |_| vec![]).await;
        let mut conn = Connection::connect(server.config("sis", "")).await.unwrap();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.execute(Request::exec_sql("x")).await,
            Err(ClientError::NotConnected)
        ));
    }
}
