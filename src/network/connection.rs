//! Client connection and query execution.
//!
//! A [`Connection`] owns one authenticated stream and a monotonically
//! increasing query token. Every operation takes `&mut self`, so the borrow
//! checker enforces the one-writer discipline the wire protocol needs: a
//! query and its continuations cannot interleave with another query's frames.
//!
//! Socket-level failures (timeout, I/O error, disconnect, broken framing)
//! force the connection closed before the error is returned; server-reported
//! query errors leave the connection usable.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use super::cursor::Cursor;
use super::handshake;
use super::protocol::{self, Frame};
use crate::error::{Error, Result};
use crate::reql::ast::Term;
use crate::reql::datum::{BinaryFormat, Datum, FormatOptions, TimeFormat};
use crate::reql::protocol::{QueryType, Response, ResponseType};

/// Default server port.
pub const DEFAULT_PORT: u16 = 28015;

/// Tokens occupy the low 30 bits and wrap around. A connection would need to
/// issue a billion queries for a collision to become possible.
pub(crate) const TOKEN_MASK: u32 = (1 << 30) - 1;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Transport requirements for a connection's underlying stream. Blanket
/// implemented, so TCP, TLS, and in-memory test streams all qualify.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

type BoxStream = Box<dyn AsyncStream>;

/// TLS settings: the CA bundle used to verify the server certificate.
#[cfg(feature = "tls")]
#[derive(Debug, Clone)]
pub struct TlsOptions {
    pub ca_file: std::path::PathBuf,
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    /// Default database applied to every query that does not override it.
    pub db: Option<String>,
    pub user: String,
    pub password: String,
    /// Applies separately to connecting, the handshake, and each frame
    /// read/write.
    pub timeout: Duration,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsOptions>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            db: None,
            user: "admin".to_string(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT,
            #[cfg(feature = "tls")]
            tls: None,
        }
    }
}

impl ConnectOptions {
    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_db<S: Into<String>>(mut self, db: S) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn with_user<S: Into<String>>(mut self, user: S, password: S) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }
}

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Override the connection's default database for this query.
    pub db: Option<String>,
    /// Fire and forget: the server sends no response at all.
    pub noreply: bool,
    /// Ask the server to profile execution and attach the trace.
    pub profile: bool,
    /// How TIME and BINARY pseudo-type values come back.
    pub formats: FormatOptions,
}

impl RunOptions {
    pub fn with_db<S: Into<String>>(mut self, db: S) -> Self {
        self.db = Some(db.into());
        self
    }

    pub fn noreply(mut self) -> Self {
        self.noreply = true;
        self
    }

    pub fn profiled(mut self) -> Self {
        self.profile = true;
        self
    }

    pub fn with_formats(mut self, formats: FormatOptions) -> Self {
        self.formats = formats;
        self
    }
}

/// What a query produced.
#[derive(Debug)]
pub enum RunResult<'a> {
    /// A single complete value.
    Atom(Datum),
    /// A streamed sequence; drain it through the cursor.
    Cursor(Cursor<'a>),
    /// Nothing: the query was sent with `noreply`.
    NoReply,
}

/// A query result plus the execution profile when one was requested.
#[derive(Debug)]
pub struct RunOutcome<'a> {
    pub profile: Option<Datum>,
    pub result: RunResult<'a>,
}

/// A single client connection to a server.
pub struct Connection {
    stream: Option<BoxStream>,
    opts: ConnectOptions,
    next_token: u32,
    /// Tokens with an open partial stream on the server.
    active: HashSet<u32>,
}

impl Connection {
    /// Create an unconnected handle. Call [`Connection::connect`] before
    /// running queries.
    pub fn new(opts: ConnectOptions) -> Self {
        Self {
            stream: None,
            opts,
            next_token: 1,
            active: HashSet::new(),
        }
    }

    /// Wrap an already-established stream, skipping TCP connect and
    /// handshake. Used for custom transports and scripted test peers.
    pub fn from_stream<S: AsyncStream + 'static>(stream: S, opts: ConnectOptions) -> Self {
        Self {
            stream: Some(Box::new(stream)),
            opts,
            next_token: 1,
            active: HashSet::new(),
        }
    }

    /// Open the TCP (or TLS) stream and run the authentication handshake.
    pub async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let timeout = self.opts.timeout;
        let addr = (self.opts.host.as_str(), self.opts.port);
        debug!(host = %self.opts.host, port = self.opts.port, "connecting");

        let tcp = timed(timeout, async { Ok(TcpStream::connect(addr).await?) }).await?;
        tcp.set_nodelay(true)?;

        let mut stream = self.wrap_stream(tcp).await?;
        timed(
            timeout,
            handshake::perform(&mut stream, &self.opts.user, &self.opts.password),
        )
        .await?;

        self.stream = Some(stream);
        self.next_token = 1;
        self.active.clear();
        Ok(())
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_stream(&self, tcp: TcpStream) -> Result<BoxStream> {
        Ok(Box::new(tcp))
    }

    #[cfg(feature = "tls")]
    async fn wrap_stream(&self, tcp: TcpStream) -> Result<BoxStream> {
        use std::sync::Arc;

        let Some(tls) = &self.opts.tls else {
            return Ok(Box::new(tcp));
        };

        let pem = std::fs::read(&tls.ca_file)?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots
                .add(cert?)
                .map_err(|e| Error::Handshake(format!("invalid CA certificate: {e}")))?;
        }

        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let server_name = rustls::pki_types::ServerName::try_from(self.opts.host.clone())
            .map_err(|e| Error::Handshake(format!("invalid server name: {e}")))?;

        let stream = connector.connect(server_name, tcp).await?;
        Ok(Box::new(stream))
    }

    /// Whether the connection currently holds an open stream.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Whether a token has an open partial stream.
    pub fn is_active(&self, token: u32) -> bool {
        self.active.contains(&token)
    }

    /// Execute a query.
    pub async fn run(&mut self, term: Term, opts: RunOptions) -> Result<RunOutcome<'_>> {
        let token = self.allocate_token();
        let payload = build_start_payload(&term, &opts, self.opts.db.as_deref())?;
        debug!(token, term = %term.term_type, "running query");

        if opts.noreply {
            self.send(token, &payload).await?;
            return Ok(RunOutcome {
                profile: None,
                result: RunResult::NoReply,
            });
        }

        let response = self.exchange(token, &payload).await?;
        self.finish_run(response, token, term, opts.formats)
    }

    fn finish_run(
        &mut self,
        mut response: Response,
        token: u32,
        term: Term,
        formats: FormatOptions,
    ) -> Result<RunOutcome<'_>> {
        if let Some(mut err) = response.to_error() {
            if let Error::Compile { query, .. } | Error::Runtime { query, .. } = &mut err {
                *query = Some(term);
            }
            return Err(err);
        }

        let profile = response
            .profile
            .take()
            .map(|value| Datum::from_wire(value, formats))
            .transpose()?;

        let result = match response.response_type {
            ResponseType::SuccessAtom => {
                let value = response
                    .results
                    .into_iter()
                    .next()
                    .ok_or_else(|| Error::MalformedResponse("atom response without value".into()))?;
                RunResult::Atom(Datum::from_wire(value, formats)?)
            }
            ResponseType::SuccessSequence => {
                let buffer = decode_batch(response.results, formats)?;
                RunResult::Cursor(Cursor::new(self, token, buffer, false, false, formats))
            }
            ResponseType::SuccessPartial => {
                self.active.insert(token);
                let feed = response.is_feed();
                let buffer = decode_batch(response.results, formats)?;
                RunResult::Cursor(Cursor::new(self, token, buffer, true, feed, formats))
            }
            other => {
                return Err(Error::MalformedResponse(format!(
                    "unexpected response type {other:?} to a start query"
                )));
            }
        };

        Ok(RunOutcome { profile, result })
    }

    /// Request the next batch for an open partial stream.
    pub(crate) async fn continue_query(&mut self, token: u32) -> Result<Response> {
        if !self.active.contains(&token) {
            return Err(Error::UnknownToken(token));
        }

        let payload = query_only_payload(QueryType::Continue);
        let response = self.exchange(token, &payload).await?;
        if response.response_type != ResponseType::SuccessPartial {
            self.active.remove(&token);
        }
        Ok(response)
    }

    /// Tell the server to discard the rest of a partial stream.
    ///
    /// The token is deregistered up front: once a stop is on the wire the
    /// stream is gone regardless of what comes back.
    pub(crate) async fn stop_query(&mut self, token: u32) -> Result<()> {
        self.active.remove(&token);

        let payload = query_only_payload(QueryType::Stop);
        self.send(token, &payload).await?;
        let frame = self.recv().await?;
        if frame.token != token {
            return Err(Error::TokenMismatch {
                expected: token,
                got: frame.token,
            });
        }
        // The acknowledgement payload carries nothing we need.
        Ok(())
    }

    /// Block until every noreply query sent so far has finished server-side.
    pub async fn noreply_wait(&mut self) -> Result<()> {
        let token = self.allocate_token();
        let payload = query_only_payload(QueryType::NoreplyWait);
        let response = self.exchange(token, &payload).await?;
        if response.response_type != ResponseType::WaitComplete {
            return Err(Error::MalformedResponse(format!(
                "unexpected response type {:?} to a noreply wait",
                response.response_type
            )));
        }
        Ok(())
    }

    /// Fetch server identity and metadata.
    pub async fn server_info(&mut self) -> Result<Datum> {
        let token = self.allocate_token();
        let payload = query_only_payload(QueryType::ServerInfo);
        let response = self.exchange(token, &payload).await?;
        if response.response_type != ResponseType::ServerInfo {
            return Err(Error::MalformedResponse(format!(
                "unexpected response type {:?} to a server info request",
                response.response_type
            )));
        }
        let value = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| Error::MalformedResponse("server info response without value".into()))?;
        Datum::from_wire(value, FormatOptions::default())
    }

    /// Close the connection. With `wait_for_noreply` set, outstanding noreply
    /// queries are allowed to finish first.
    pub async fn close(&mut self, wait_for_noreply: bool) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::NotConnected);
        }
        if wait_for_noreply {
            self.noreply_wait().await?;
        }

        self.active.clear();
        if let Some(mut stream) = self.stream.take() {
            use tokio::io::AsyncWriteExt;
            stream.shutdown().await?;
        }
        Ok(())
    }

    /// Close (if open) and establish a fresh connection.
    pub async fn reconnect(&mut self, wait_for_noreply: bool) -> Result<()> {
        if self.stream.is_some() {
            self.close(wait_for_noreply).await?;
        }
        self.connect().await
    }

    fn allocate_token(&mut self) -> u32 {
        let token = self.next_token;
        self.next_token = (token + 1) & TOKEN_MASK;
        token
    }

    async fn exchange(&mut self, token: u32, payload: &[u8]) -> Result<Response> {
        self.send(token, payload).await?;
        let frame = self.recv().await?;
        if frame.token != token {
            return Err(Error::TokenMismatch {
                expected: token,
                got: frame.token,
            });
        }
        Response::from_payload(&frame.payload)
    }

    async fn send(&mut self, token: u32, payload: &[u8]) -> Result<()> {
        let timeout = self.opts.timeout;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let result = timed(timeout, protocol::write_frame(stream, token, payload)).await;
        self.close_on_fatal(&result);
        result
    }

    async fn recv(&mut self) -> Result<Frame> {
        let timeout = self.opts.timeout;
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let result = timed(timeout, protocol::read_frame(stream)).await;
        self.close_on_fatal(&result);
        result
    }

    /// Drop the stream when an error means the wire can no longer be trusted.
    fn close_on_fatal<T>(&mut self, result: &Result<T>) {
        if let Err(
            Error::Timeout | Error::Io(_) | Error::Disconnected | Error::MalformedResponse(_),
        ) = result
        {
            self.stream = None;
            self.active.clear();
        }
    }
}

async fn timed<T>(timeout: Duration, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout),
    }
}

/// Serialize a `[START, term, optargs]` envelope.
fn build_start_payload(term: &Term, opts: &RunOptions, default_db: Option<&str>) -> Result<Vec<u8>> {
    let mut optargs = serde_json::Map::new();
    if let Some(db) = opts.db.as_deref().or(default_db) {
        optargs.insert("db".to_string(), Term::db(db).encode()?);
    }
    if opts.profile {
        optargs.insert("profile".to_string(), Value::Bool(true));
    }
    if opts.noreply {
        optargs.insert("noreply".to_string(), Value::Bool(true));
    }
    if opts.formats.time_format == TimeFormat::Raw {
        optargs.insert("time_format".to_string(), Value::String("raw".to_string()));
    }
    if opts.formats.binary_format == BinaryFormat::Raw {
        optargs.insert("binary_format".to_string(), Value::String("raw".to_string()));
    }

    let mut envelope = vec![
        Value::from(QueryType::Start.wire_code()),
        term.encode()?,
    ];
    if !optargs.is_empty() {
        envelope.push(Value::Object(optargs));
    }
    Ok(serde_json::to_vec(&Value::Array(envelope))?)
}

/// Serialize a bare `[CONTINUE]`-style envelope.
fn query_only_payload(query_type: QueryType) -> Vec<u8> {
    format!("[{}]", query_type.wire_code()).into_bytes()
}

fn decode_batch(results: Vec<Value>, formats: FormatOptions) -> Result<VecDeque<Datum>> {
    results
        .into_iter()
        .map(|value| Datum::from_wire(value, formats))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_token_allocation_wraps() {
        let mut conn = Connection::new(ConnectOptions::default());
        assert_eq!(conn.allocate_token(), 1);
        assert_eq!(conn.allocate_token(), 2);

        conn.next_token = TOKEN_MASK;
        assert_eq!(conn.allocate_token(), TOKEN_MASK);
        assert_eq!(conn.allocate_token(), 0);
    }

    #[test]
    fn test_start_payload_shape() {
        let term = Term::db_list();
        let payload = build_start_payload(&term, &RunOptions::default(), None).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value, json!([1, [79, []]]));
    }

    #[test]
    fn test_start_payload_optargs() {
        let term = Term::table_list();
        let opts = RunOptions::default().profiled().with_formats(FormatOptions {
            time_format: TimeFormat::Raw,
            binary_format: BinaryFormat::Raw,
        });
        let payload = build_start_payload(&term, &opts, Some("prod")).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            value,
            json!([1, [82, []], {
                "db": [9, ["prod"]],
                "profile": true,
                "time_format": "raw",
                "binary_format": "raw",
            }])
        );
    }

    #[test]
    fn test_run_options_db_overrides_default() {
        let term = Term::db_list();
        let opts = RunOptions::default().with_db("override");
        let payload = build_start_payload(&term, &opts, Some("default")).unwrap();
        let value: Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value[2]["db"], json!([9, ["override"]]));
    }

    #[test]
    fn test_query_only_payload() {
        assert_eq!(query_only_payload(QueryType::Continue), b"[2]");
        assert_eq!(query_only_payload(QueryType::Stop), b"[3]");
    }

    #[test]
    fn test_connect_options_builder() {
        let opts = ConnectOptions::default()
            .with_host("db.internal")
            .with_port(28016)
            .with_db("app")
            .with_user("svc", "secret")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(opts.host, "db.internal");
        assert_eq!(opts.port, 28016);
        assert_eq!(opts.db.as_deref(), Some("app"));
        assert_eq!(opts.user, "svc");
        assert_eq!(opts.password, "secret");
        assert_eq!(opts.timeout, Duration::from_secs(5));
    }
}
