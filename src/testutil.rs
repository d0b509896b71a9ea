//! In-process backends and raw clients for tests.
//!
//! The fake backends are real [`Server`] instances speaking RESP over
//! loopback sockets, either with a tiny in-memory store or with a scripted
//! per-command reply. Transactions are emulated the way a real server
//! answers them: `+OK`, one `+QUEUED` per command, then the `EXEC` array.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::Result;
use crate::registry::ServerRegistry;
use crate::resp::RespValue;
use crate::server::{Command, Handler, Request, ResponseWriter, Server, ServerConfig};
use crate::transport::Transport;

/// A backend server running on a loopback socket.
pub(crate) struct Backend {
    addr: String,
    _server: Arc<Server>,
    task: tokio::task::JoinHandle<()>,
}

impl Backend {
    pub(crate) fn addr(&self) -> String {
        self.addr.clone()
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn spawn_backend(handler: Arc<dyn Handler>) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr").to_string();

    let server = Arc::new(Server::new(
        ServerConfig {
            bind: addr.clone(),
            ..ServerConfig::default()
        },
        handler,
    ));

    let serving = server.clone();
    let task = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    Backend {
        addr,
        _server: server,
        task,
    }
}

/// Backend with an in-memory store handling SET/GET/DEL/RPUSH/LRANGE/PING.
pub(crate) async fn spawn_store_backend() -> Backend {
    spawn_backend(Arc::new(StoreHandler::default())).await
}

/// Backend replying to every command through `script`.
pub(crate) async fn spawn_script_backend<F>(script: F) -> Backend
where
    F: Fn(&Command) -> RespValue + Send + Sync + 'static,
{
    spawn_backend(Arc::new(ScriptHandler { script })).await
}

/// Answer a request the way a Redis server does, given a per-command reply
/// function. Transactions get the queueing preamble and a buffered `EXEC`
/// array.
fn answer_request(
    w: &mut dyn ResponseWriter,
    req: &Request,
    apply: &mut dyn FnMut(&Command) -> RespValue,
) -> Result<()> {
    if req.is_transaction() {
        w.write(RespValue::ok())?;
        for _ in req.inner_cmds() {
            w.write(RespValue::SimpleString("QUEUED".to_string()))?;
        }

        let closing = req.cmds.last().map(|cmd| cmd.name.clone());
        if closing.as_deref() == Some("DISCARD") {
            w.write(RespValue::ok())?;
        } else {
            let results: Vec<RespValue> = req.inner_cmds().iter().map(|cmd| apply(cmd)).collect();
            w.write(RespValue::Array(Some(results)))?;
        }
        return Ok(());
    }

    for cmd in &req.cmds {
        let reply = apply(cmd);
        w.write(reply)?;
    }
    Ok(())
}

enum StoreValue {
    Str(Bytes),
    List(Vec<Bytes>),
}

/// Minimal key/value handler backing the end-to-end tests.
#[derive(Default)]
struct StoreHandler {
    store: Mutex<HashMap<Vec<u8>, StoreValue>>,
}

impl StoreHandler {
    fn apply(&self, cmd: &Command) -> RespValue {
        let mut store = self.store.lock().expect("store poisoned");

        match cmd.name.as_str() {
            "PING" => RespValue::SimpleString("PONG".to_string()),
            "SET" => match (cmd.args.first(), cmd.args.get(1)) {
                (Some(key), Some(value)) => {
                    store.insert(key.to_vec(), StoreValue::Str(value.clone()));
                    RespValue::ok()
                }
                _ => RespValue::error("ERR wrong number of arguments for 'set' command"),
            },
            "GET" => match cmd.args.first() {
                Some(key) => match store.get(key.as_ref()) {
                    Some(StoreValue::Str(value)) => RespValue::BulkString(Some(value.clone())),
                    Some(StoreValue::List(_)) => RespValue::error(
                        "WRONGTYPE Operation against a key holding the wrong kind of value",
                    ),
                    None => RespValue::BulkString(None),
                },
                None => RespValue::error("ERR wrong number of arguments for 'get' command"),
            },
            "DEL" => {
                let mut removed = 0i64;
                for key in &cmd.args {
                    if store.remove(key.as_ref()).is_some() {
                        removed += 1;
                    }
                }
                RespValue::Integer(removed)
            }
            "RPUSH" => match cmd.args.first() {
                Some(key) => {
                    let entry = store
                        .entry(key.to_vec())
                        .or_insert_with(|| StoreValue::List(Vec::new()));
                    match entry {
                        StoreValue::List(list) => {
                            list.extend(cmd.args[1..].iter().cloned());
                            RespValue::Integer(list.len() as i64)
                        }
                        StoreValue::Str(_) => RespValue::error(
                            "WRONGTYPE Operation against a key holding the wrong kind of value",
                        ),
                    }
                }
                None => RespValue::error("ERR wrong number of arguments for 'rpush' command"),
            },
            "LRANGE" => {
                let (Ok(start), Ok(stop)) = (cmd.arg::<i64>(1), cmd.arg::<i64>(2)) else {
                    return RespValue::error("ERR value is not an integer or out of range");
                };
                let Some(key) = cmd.args.first() else {
                    return RespValue::error("ERR wrong number of arguments for 'lrange' command");
                };

                let list = match store.get(key.as_ref()) {
                    Some(StoreValue::List(list)) => list.as_slice(),
                    Some(StoreValue::Str(_)) => {
                        return RespValue::error(
                            "WRONGTYPE Operation against a key holding the wrong kind of value",
                        );
                    }
                    None => &[],
                };

                let len = list.len() as i64;
                let from = if start < 0 { (len + start).max(0) } else { start };
                let to = if stop < 0 { len + stop } else { stop.min(len - 1) };

                let mut out = Vec::new();
                if from <= to {
                    for value in &list[from as usize..=(to as usize).min(list.len() - 1)] {
                        out.push(RespValue::BulkString(Some(value.clone())));
                    }
                }
                RespValue::Array(Some(out))
            }
            other => RespValue::error(format!("ERR unknown command '{other}'")),
        }
    }
}

#[async_trait]
impl Handler for StoreHandler {
    async fn serve(&self, w: &mut dyn ResponseWriter, req: Request) -> Result<()> {
        answer_request(w, &req, &mut |cmd| self.apply(cmd))
    }
}

struct ScriptHandler<F> {
    script: F,
}

#[async_trait]
impl<F> Handler for ScriptHandler<F>
where
    F: Fn(&Command) -> RespValue + Send + Sync,
{
    async fn serve(&self, w: &mut dyn ResponseWriter, req: Request) -> Result<()> {
        answer_request(w, &req, &mut |cmd| (self.script)(cmd))
    }
}

/// A proxy server fronting a set of backends, plus everything that must
/// stay alive for its lifetime.
pub(crate) struct ProxyFixture {
    addr: String,
    _server: Arc<Server>,
    task: tokio::task::JoinHandle<()>,
    _backends: Vec<Backend>,
}

impl ProxyFixture {
    pub(crate) async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(&self.addr).await.expect("connect proxy");
        stream.set_nodelay(true).expect("nodelay");
        TestClient { stream }
    }
}

impl Drop for ProxyFixture {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start a proxy server over `registry`/`transport`, keeping `backends`
/// alive alongside it.
pub(crate) async fn spawn_proxy(
    registry: Arc<dyn ServerRegistry>,
    transport: Arc<Transport>,
    pipeline: bool,
    retry: bool,
    backends: Vec<Backend>,
) -> ProxyFixture {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback");
    let addr = listener.local_addr().expect("local addr").to_string();

    let proxy = Arc::new(crate::proxy::ReverseProxy::new(transport, registry));
    let server = Arc::new(Server::new(
        ServerConfig {
            bind: addr.clone(),
            enable_pipeline: pipeline,
            enable_retry: retry,
            ..ServerConfig::default()
        },
        proxy,
    ));

    let serving = server.clone();
    let task = tokio::spawn(async move {
        let _ = serving.serve(listener).await;
    });

    ProxyFixture {
        addr,
        _server: server,
        task,
        _backends: backends,
    }
}

/// Byte-level RESP client for wire assertions.
pub(crate) struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub(crate) async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("client write");
    }

    /// Read exactly `expected.len()` bytes and compare.
    pub(crate) async fn expect(&mut self, expected: &[u8]) {
        let mut got = vec![0u8; expected.len()];
        self.stream.read_exact(&mut got).await.expect("client read");
        assert_eq!(
            String::from_utf8_lossy(&got),
            String::from_utf8_lossy(expected),
            "wire bytes differ"
        );
    }
}
