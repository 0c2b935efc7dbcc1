//! In-process JSON-RPC server emulating the three `eth_*` methods the
//! indexer consumes, with per-height failure injection, a movable tip, and
//! a timestamped call log for rate-limit assertions.

use std::{
    collections::HashSet,
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{body, Body, Method, Request, Response, Server, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TXS_PER_BLOCK: u64 = 2;
const LOGS_PER_TX: u64 = 1;

#[derive(Clone)]
pub struct MockChain {
    tip: Arc<AtomicU64>,
    /// Extra entropy mixed into block hashes; bumping it after a height
    /// rewrites history from the caller's point of view.
    salts: Arc<RwLock<Vec<(u64, u64)>>>,
    fail_heights: Arc<RwLock<HashSet<u64>>>,
    calls: Arc<Mutex<Vec<(Instant, String)>>>,
}

impl MockChain {
    pub fn new(tip: u64) -> Self {
        Self {
            tip: Arc::new(AtomicU64::new(tip)),
            salts: Arc::new(RwLock::new(Vec::new())),
            fail_heights: Arc::new(RwLock::new(HashSet::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn tip(&self) -> u64 {
        self.tip.load(Ordering::SeqCst)
    }

    pub fn set_tip(&self, height: u64) {
        self.tip.store(height, Ordering::SeqCst);
    }

    /// Make every request for this height fail with a server error.
    pub fn poison_height(&self, height: u64) {
        self.fail_heights
            .write()
            .expect("mock chain poisoned")
            .insert(height);
    }

    /// Rewrite the hash served for `height`, emulating a replaced block.
    pub fn rewrite_hash(&self, height: u64, salt: u64) {
        self.salts
            .write()
            .expect("mock chain poisoned")
            .push((height, salt));
    }

    pub fn block_hash(&self, height: u64) -> String {
        let salt = self
            .salts
            .read()
            .expect("mock chain poisoned")
            .iter()
            .filter(|(salted, _)| *salted == height)
            .map(|(_, salt)| *salt)
            .last()
            .unwrap_or(0);
        format!("0x{:064x}", (height << 16) | salt)
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock chain poisoned").len()
    }

    /// Largest number of calls observed inside any sliding interval of
    /// `window`, across the whole call log.
    pub fn max_calls_in_any_window(&self, window: Duration) -> usize {
        let calls = self.calls.lock().expect("mock chain poisoned");
        let mut stamps: Vec<Instant> = calls.iter().map(|(stamp, _)| *stamp).collect();
        stamps.sort();

        let mut max = 0;
        let mut left = 0;
        for right in 0..stamps.len() {
            while stamps[right].duration_since(stamps[left]) >= window {
                left += 1;
            }
            max = max.max(right - left + 1);
        }
        max
    }

    fn record_call(&self, method: &str) {
        self.calls
            .lock()
            .expect("mock chain poisoned")
            .push((Instant::now(), method.to_owned()));
    }

    fn is_poisoned(&self, height: u64) -> bool {
        self.fail_heights
            .read()
            .expect("mock chain poisoned")
            .contains(&height)
    }

    /// Shared plumbing for the two height-addressed methods: parameter
    /// decoding, failure injection, and the null result above the tip.
    fn serve_height<F>(&self, params: &[Value], render: F) -> Result<Value, (i64, String)>
    where
        F: FnOnce(&Self, u64) -> Value,
    {
        let Some(height) = params.first().and_then(Value::as_str).and_then(parse_quantity)
        else {
            return Err((-32602, "first parameter must be a hex block number".to_owned()));
        };
        if self.is_poisoned(height) {
            return Err((-32000, format!("injected failure at height {height}")));
        }
        if height > self.tip() {
            return Ok(Value::Null);
        }
        Ok(render(self, height))
    }

    fn tx_hash(&self, height: u64, index: u64) -> String {
        format!("0x{:064x}", height * 1_000 + index + 1)
    }

    fn block_json(&self, height: u64) -> Value {
        let transactions: Vec<Value> = (0..TXS_PER_BLOCK)
            .map(|index| {
                json!({
                    "hash": self.tx_hash(height, index),
                    "transactionIndex": format!("{index:#x}"),
                    "from": "0x00000000000000000000000000000000000000f0",
                    "to": if index == 0 { Value::Null } else {
                        Value::String("0x00000000000000000000000000000000000000e2".into())
                    },
                    "value": "0xde0b6b3a7640000",
                    "gas": "0x5208",
                    "gasPrice": "0x3b9aca00",
                    "nonce": format!("{height:#x}"),
                    "input": "0x",
                })
            })
            .collect();

        json!({
            "number": format!("{height:#x}"),
            "hash": self.block_hash(height),
            "parentHash": if height == 0 {
                format!("0x{:064x}", 0)
            } else {
                self.block_hash(height - 1)
            },
            "timestamp": format!("{:#x}", 1_700_000_000 + height),
            "miner": "0x00000000000000000000000000000000000000aa",
            "gasUsed": "0xa410",
            "gasLimit": "0x1c9c380",
            "baseFeePerGas": "0x3b9aca00",
            "transactions": transactions,
        })
    }

    fn receipts_json(&self, height: u64) -> Value {
        let receipts: Vec<Value> = (0..TXS_PER_BLOCK)
            .map(|index| {
                let tx_hash = self.tx_hash(height, index);
                let logs: Vec<Value> = (0..LOGS_PER_TX)
                    .map(|log_index| {
                        json!({
                            "address": "0x00000000000000000000000000000000000000cc",
                            "topics": [
                                format!("0x{:064x}", 0xfeedu64),
                                format!("0x{:064x}", height),
                            ],
                            "data": "0x00",
                            "logIndex": format!("{:#x}", index * LOGS_PER_TX + log_index),
                            "transactionHash": tx_hash,
                        })
                    })
                    .collect();
                json!({
                    "transactionHash": tx_hash,
                    "status": "0x1",
                    "logs": logs,
                })
            })
            .collect();
        Value::Array(receipts)
    }
}

/// One mock node bound to an ephemeral local port. Lives until
/// [`Self::shutdown`]; requests are served by [`dispatch`] against the
/// shared [`MockChain`].
pub struct MockRpcServer {
    endpoint: String,
    stop: CancellationToken,
    served: JoinHandle<()>,
}

impl MockRpcServer {
    pub async fn start(chain: MockChain) -> Result<Self> {
        let service = make_service_fn(move |_| {
            let chain = chain.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |request| respond(chain.clone(), request)))
            }
        });

        let addr: SocketAddr = ([127, 0, 0, 1], 0).into();
        let server = Server::try_bind(&addr)
            .context("mock node could not bind a local port")?
            .serve(service);
        let endpoint = format!("http://{}", server.local_addr());

        let stop = CancellationToken::new();
        let signal = stop.clone();
        let graceful = server.with_graceful_shutdown(async move { signal.cancelled().await });
        let served = tokio::spawn(async move {
            if let Err(err) = graceful.await {
                tracing::warn!(error = %err, "mock node terminated abnormally");
            }
        });

        Ok(Self {
            endpoint,
            stop,
            served,
        })
    }

    pub fn url(&self) -> &str {
        &self.endpoint
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        let _ = self.served.await;
    }
}

/// Everything this server understands about an incoming call. Unknown
/// fields are ignored; missing ones default so malformed requests still
/// produce a JSON-RPC error instead of a transport failure.
#[derive(Deserialize)]
struct RpcCall {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

async fn respond(chain: MockChain, request: Request<Body>) -> Result<Response<Body>, Infallible> {
    if request.method() != Method::POST {
        return Ok(plain_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "JSON-RPC requests must be POSTed".to_owned(),
        ));
    }

    let bytes = match body::to_bytes(request.into_body()).await {
        Ok(bytes) => bytes,
        Err(err) => {
            return Ok(plain_error(
                StatusCode::BAD_REQUEST,
                format!("unreadable request body: {err}"),
            ));
        }
    };

    let reply = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Array(batch)) => Value::Array(
            batch
                .into_iter()
                .map(|call| dispatch(&chain, call))
                .collect(),
        ),
        Ok(single) => dispatch(&chain, single),
        Err(err) => {
            return Ok(plain_error(
                StatusCode::BAD_REQUEST,
                format!("request body is not JSON: {err}"),
            ));
        }
    };

    let mut response = Response::new(Body::from(reply.to_string()));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn dispatch(chain: &MockChain, raw: Value) -> Value {
    let call: RpcCall = match serde_json::from_value(raw) {
        Ok(call) => call,
        Err(err) => {
            return envelope(Value::Null, Err((-32600, format!("malformed request: {err}"))));
        }
    };
    chain.record_call(&call.method);

    let outcome = match call.method.as_str() {
        "eth_blockNumber" => Ok(json!(format!("{:#x}", chain.tip()))),
        "eth_getBlockByNumber" => {
            chain.serve_height(&call.params, |chain, height| chain.block_json(height))
        }
        "eth_getBlockReceipts" => {
            chain.serve_height(&call.params, |chain, height| chain.receipts_json(height))
        }
        other => Err((-32601, format!("method {other} is not implemented"))),
    };
    envelope(call.id, outcome)
}

fn envelope(id: Value, outcome: Result<Value, (i64, String)>) -> Value {
    match outcome {
        Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
        Err((code, message)) => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": code, "message": message },
        }),
    }
}

fn plain_error(status: StatusCode, message: String) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

fn parse_quantity(raw: &str) -> Option<u64> {
    u64::from_str_radix(raw.strip_prefix("0x")?, 16).ok()
}
