// tests/integration/fixtures.rs

//! An in-process RESP server for integration tests.
//!
//! It understands the commands the client issues during its own lifecycle
//! (HELLO, AUTH, CLIENT, SELECT, PING) plus GET/SET/DEL, PUBLISH and the
//! subscribe family, and implements key tracking with redirected
//! invalidations. Hooks let a test kill connections, flush the keyspace, and
//! split every reply across two reads.
//!
//! `SLEEP <ms>` replies `+OK` after the given delay and is used to provoke
//! command timeouts.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spineldb_client::RespFrame;
use spineldb_client::core::protocol::RespFrameCodec;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use wildmatch::WildMatch;

pub const TEST_KEY1: &str = "test_key_1";
pub const TEST_KEY2: &str = "test_key_2";
pub const TEST_VALUE1: &str = "test_value_1";
pub const TEST_VALUE2: &str = "test_value_2";

pub const INVALIDATION_CHANNEL: &str = "__redis__:invalidate";

struct Peer {
    tx: mpsc::UnboundedSender<RespFrame>,
    kill: CancellationToken,
    resp3: bool,
    name: Option<String>,
    database: u8,
    channels: HashSet<Bytes>,
    patterns: HashSet<Bytes>,
    shards: HashSet<Bytes>,
    redirect: Option<u64>,
    bcast: Option<Vec<Bytes>>,
}

impl Peer {
    fn subscription_count(&self) -> usize {
        self.channels.len() + self.patterns.len() + self.shards.len()
    }

    fn push(&self, items: Vec<RespFrame>) {
        let frame = if self.resp3 {
            RespFrame::Push(items)
        } else {
            RespFrame::Array(items)
        };
        let _ = self.tx.send(frame);
    }
}

#[derive(Default)]
struct Shared {
    data: HashMap<Bytes, Bytes>,
    peers: HashMap<u64, Peer>,
    /// key -> ids of tracking clients that read it
    readers: HashMap<Bytes, HashSet<u64>>,
    command_counts: HashMap<String, usize>,
}

struct Inner {
    shared: Mutex<Shared>,
    next_id: AtomicU64,
    accepted: AtomicUsize,
    split_replies: AtomicBool,
    password: Option<String>,
}

/// A running mock server. Stops accepting when dropped.
pub struct MockServer {
    addr: SocketAddr,
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl MockServer {
    pub async fn start() -> Self {
        Self::start_with_password(None).await
    }

    pub async fn start_with_password(password: Option<&str>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared::default()),
            next_id: AtomicU64::new(100),
            accepted: AtomicUsize::new(0),
            split_replies: AtomicBool::new(false),
            password: password.map(str::to_owned),
        });
        let shutdown = CancellationToken::new();

        let accept_inner = Arc::clone(&inner);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { break };
                        accept_inner.accepted.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve(Arc::clone(&accept_inner), stream));
                    }
                    _ = accept_shutdown.cancelled() => break,
                }
            }
        });

        Self {
            addr,
            inner,
            shutdown,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Total connections accepted since start.
    pub fn accepted(&self) -> usize {
        self.inner.accepted.load(Ordering::SeqCst)
    }

    /// Connections currently open.
    pub fn open_connections(&self) -> usize {
        self.inner.shared.lock().peers.len()
    }

    pub fn command_count(&self, name: &str) -> usize {
        self.inner
            .shared
            .lock()
            .command_counts
            .get(&name.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn client_names(&self) -> Vec<String> {
        self.inner
            .shared
            .lock()
            .peers
            .values()
            .filter_map(|p| p.name.clone())
            .collect()
    }

    pub fn databases(&self) -> Vec<u8> {
        self.inner
            .shared
            .lock()
            .peers
            .values()
            .map(|p| p.database)
            .collect()
    }

    /// The redirect targets of every tracking connection.
    pub fn tracking_redirects(&self) -> Vec<u64> {
        self.inner
            .shared
            .lock()
            .peers
            .values()
            .filter_map(|p| p.redirect)
            .collect()
    }

    /// Subscription counts of the connections holding at least one, sorted.
    pub fn subscription_counts(&self) -> Vec<usize> {
        let mut counts: Vec<usize> = self
            .inner
            .shared
            .lock()
            .peers
            .values()
            .map(Peer::subscription_count)
            .filter(|&n| n > 0)
            .collect();
        counts.sort_unstable();
        counts
    }

    /// When set, every reply is written in two parts with a pause before the
    /// final byte.
    pub fn split_replies(&self, enabled: bool) {
        self.inner.split_replies.store(enabled, Ordering::SeqCst);
    }

    /// Reads a key as stored on the server, prefix included.
    pub fn value(&self, key: &str) -> Option<Bytes> {
        self.inner.shared.lock().data.get(key.as_bytes()).cloned()
    }

    /// Writes a key directly, invalidating readers the way a second client would.
    pub fn set_value(&self, key: &str, value: &str) {
        let key = Bytes::copy_from_slice(key.as_bytes());
        let mut shared = self.inner.shared.lock();
        shared
            .data
            .insert(key.clone(), Bytes::copy_from_slice(value.as_bytes()));
        invalidate(&mut shared, &key);
    }

    /// Empties the keyspace and sends a null invalidation to every target.
    pub fn flush_all(&self) {
        let mut shared = self.inner.shared.lock();
        shared.data.clear();
        shared.readers.clear();
        flush_invalidation(&shared);
    }

    /// Drops every connection that has at least one subscription.
    pub fn kill_subscribers(&self) -> usize {
        let shared = self.inner.shared.lock();
        let mut killed = 0;
        for peer in shared.peers.values() {
            if peer.subscription_count() > 0 {
                peer.kill.cancel();
                killed += 1;
            }
        }
        killed
    }

    pub fn kill_client(&self, id: u64) -> bool {
        match self.inner.shared.lock().peers.get(&id) {
            Some(peer) => {
                peer.kill.cancel();
                true
            }
            None => false,
        }
    }

    pub fn kill_all(&self) {
        for peer in self.inner.shared.lock().peers.values() {
            peer.kill.cancel();
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.kill_all();
    }
}

fn bulk(b: impl AsRef<[u8]>) -> RespFrame {
    RespFrame::BulkString(Bytes::copy_from_slice(b.as_ref()))
}

fn ok() -> RespFrame {
    RespFrame::SimpleString("OK".into())
}

fn err(msg: &str) -> RespFrame {
    RespFrame::Error(msg.to_string())
}

/// Sends an invalidation for `key` to whoever should receive it.
fn invalidate(shared: &mut Shared, key: &Bytes) {
    let mut targets: HashSet<u64> = HashSet::new();
    if let Some(readers) = shared.readers.remove(key) {
        targets.extend(
            readers
                .iter()
                .filter_map(|id| shared.peers.get(id).and_then(|p| p.redirect)),
        );
    }
    for peer in shared.peers.values() {
        if let (Some(prefixes), Some(redirect)) = (&peer.bcast, peer.redirect)
            && (prefixes.is_empty() || prefixes.iter().any(|p| key.starts_with(p)))
        {
            targets.insert(redirect);
        }
    }
    for target in targets {
        send_invalidation(shared, target, RespFrame::Array(vec![RespFrame::BulkString(key.clone())]));
    }
}

fn flush_invalidation(shared: &Shared) {
    let targets: HashSet<u64> = shared.peers.values().filter_map(|p| p.redirect).collect();
    for target in targets {
        send_invalidation(shared, target, RespFrame::Null);
    }
}

fn send_invalidation(shared: &Shared, target: u64, payload: RespFrame) {
    let Some(peer) = shared.peers.get(&target) else {
        return;
    };
    if peer.resp3 {
        peer.push(vec![bulk("invalidate"), payload]);
    } else if peer.channels.contains(INVALIDATION_CHANNEL.as_bytes()) {
        peer.push(vec![bulk("message"), bulk(INVALIDATION_CHANNEL), payload]);
    }
}

async fn serve(inner: Arc<Inner>, stream: TcpStream) {
    let id = inner.next_id.fetch_add(1, Ordering::SeqCst);
    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<RespFrame>();
    let kill = CancellationToken::new();
    inner.shared.lock().peers.insert(
        id,
        Peer {
            tx: tx.clone(),
            kill: kill.clone(),
            resp3: false,
            name: None,
            database: 0,
            channels: HashSet::new(),
            patterns: HashSet::new(),
            shards: HashSet::new(),
            redirect: None,
            bcast: None,
        },
    );

    let writer_inner = Arc::clone(&inner);
    let writer_kill = kill.clone();
    tokio::spawn(async move {
        let mut codec = RespFrameCodec::default();
        loop {
            let frame = tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = writer_kill.cancelled() => break,
            };
            let mut buf = BytesMut::new();
            if codec.encode(frame, &mut buf).is_err() {
                break;
            }
            if writer_inner.split_replies.load(Ordering::SeqCst) && buf.len() > 1 {
                let last = buf.split_off(buf.len() - 1);
                if wr.write_all(&buf).await.is_err() {
                    break;
                }
                let _ = wr.flush().await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                if wr.write_all(&last).await.is_err() {
                    break;
                }
            } else if wr.write_all(&buf).await.is_err() {
                break;
            }
        }
    });

    let mut codec = RespFrameCodec::default();
    let mut buf = BytesMut::with_capacity(4096);
    'conn: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(frame)) => {
                    for reply in handle(&inner, id, frame).await {
                        let _ = tx.send(reply);
                    }
                }
                Ok(None) => break,
                Err(_) => break 'conn,
            }
        }
        tokio::select! {
            read = rd.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            _ = kill.cancelled() => break,
        }
    }
    kill.cancel();
    let mut shared = inner.shared.lock();
    shared.peers.remove(&id);
    for readers in shared.readers.values_mut() {
        readers.remove(&id);
    }
}

fn args_of(frame: RespFrame) -> Vec<Bytes> {
    match frame {
        RespFrame::Array(items) => items
            .into_iter()
            .filter_map(|f| f.as_bytes().map(Bytes::copy_from_slice))
            .collect(),
        _ => Vec::new(),
    }
}

fn text(b: &Bytes) -> String {
    String::from_utf8_lossy(b).into_owned()
}

async fn handle(inner: &Inner, id: u64, frame: RespFrame) -> Vec<RespFrame> {
    let args = args_of(frame);
    let Some(name) = args.first().map(|n| text(n).to_ascii_uppercase()) else {
        return vec![err("ERR empty command")];
    };
    *inner
        .shared
        .lock()
        .command_counts
        .entry(name.clone())
        .or_default() += 1;

    if name == "SLEEP" {
        let ms = args.get(1).and_then(|a| text(a).parse().ok()).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        return vec![ok()];
    }

    let mut shared = inner.shared.lock();
    match name.as_str() {
        "HELLO" => {
            let mut i = 2;
            while i < args.len() {
                match text(&args[i]).to_ascii_uppercase().as_str() {
                    "AUTH" => {
                        let pass = args.get(i + 2).map(text);
                        if inner.password.is_some() && pass != inner.password {
                            return vec![err("WRONGPASS invalid username-password pair")];
                        }
                        i += 3;
                    }
                    "SETNAME" => {
                        if let Some(peer) = shared.peers.get_mut(&id) {
                            peer.name = args.get(i + 1).map(text);
                        }
                        i += 2;
                    }
                    _ => i += 1,
                }
            }
            if inner.password.is_some() && !args.iter().any(|a| a.eq_ignore_ascii_case(b"AUTH")) {
                return vec![err("NOAUTH HELLO must be called with the client already authenticated")];
            }
            let resp3 = args.get(1).is_some_and(|v| v.as_ref() == b"3");
            if let Some(peer) = shared.peers.get_mut(&id) {
                peer.resp3 = resp3;
            }
            vec![RespFrame::Map(vec![
                (bulk("server"), bulk("mock")),
                (bulk("proto"), RespFrame::Integer(if resp3 { 3 } else { 2 })),
                (bulk("id"), RespFrame::Integer(id as i64)),
            ])]
        }
        "AUTH" => {
            let pass = args.last().map(text);
            if inner.password.is_some() && pass != inner.password {
                vec![err("WRONGPASS invalid username-password pair")]
            } else {
                vec![ok()]
            }
        }
        "SELECT" => {
            let db = args.get(1).and_then(|a| text(a).parse::<u8>().ok());
            match (db, shared.peers.get_mut(&id)) {
                (Some(db), Some(peer)) if db < 16 => {
                    peer.database = db;
                    vec![ok()]
                }
                _ => vec![err("ERR DB index is out of range")],
            }
        }
        "CLIENT" => client_command(&mut shared, id, &args),
        "PING" => {
            let subscribed = shared
                .peers
                .get(&id)
                .is_some_and(|p| !p.resp3 && p.subscription_count() > 0);
            if subscribed {
                vec![RespFrame::Array(vec![bulk("pong"), bulk("")])]
            } else {
                vec![RespFrame::SimpleString("PONG".into())]
            }
        }
        "GET" => {
            let Some(key) = args.get(1).cloned() else {
                return vec![err("ERR wrong number of arguments for 'get' command")];
            };
            if shared.peers.get(&id).is_some_and(|p| p.redirect.is_some() && p.bcast.is_none()) {
                shared.readers.entry(key.clone()).or_default().insert(id);
            }
            match shared.data.get(&key) {
                Some(value) => vec![RespFrame::BulkString(value.clone())],
                None => vec![RespFrame::Null],
            }
        }
        "SET" => {
            let (Some(key), Some(value)) = (args.get(1).cloned(), args.get(2).cloned()) else {
                return vec![err("ERR wrong number of arguments for 'set' command")];
            };
            shared.data.insert(key.clone(), value);
            invalidate(&mut shared, &key);
            vec![ok()]
        }
        "DEL" => {
            let mut removed = 0;
            for key in &args[1..] {
                if shared.data.remove(key).is_some() {
                    removed += 1;
                }
                invalidate(&mut shared, key);
            }
            vec![RespFrame::Integer(removed)]
        }
        "FLUSHALL" => {
            shared.data.clear();
            shared.readers.clear();
            flush_invalidation(&shared);
            vec![ok()]
        }
        "PUBLISH" | "SPUBLISH" => {
            let (Some(channel), Some(message)) = (args.get(1).cloned(), args.get(2).cloned()) else {
                return vec![err("ERR wrong number of arguments")];
            };
            let shard = name == "SPUBLISH";
            let mut receivers = 0;
            for peer in shared.peers.values() {
                if shard {
                    if peer.shards.contains(&channel) {
                        peer.push(vec![bulk("smessage"), bulk(&channel), bulk(&message)]);
                        receivers += 1;
                    }
                    continue;
                }
                if peer.channels.contains(&channel) {
                    peer.push(vec![bulk("message"), bulk(&channel), bulk(&message)]);
                    receivers += 1;
                }
                for pattern in &peer.patterns {
                    if WildMatch::new(&text(pattern)).matches(&text(&channel)) {
                        peer.push(vec![
                            bulk("pmessage"),
                            bulk(pattern),
                            bulk(&channel),
                            bulk(&message),
                        ]);
                        receivers += 1;
                    }
                }
            }
            vec![RespFrame::Integer(receivers)]
        }
        "SUBSCRIBE" | "PSUBSCRIBE" | "SSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE"
        | "SUNSUBSCRIBE" => {
            let Some(peer) = shared.peers.get_mut(&id) else {
                return Vec::new();
            };
            let subscribe = !name.contains("UNSUB");
            let tag = name.to_ascii_lowercase();
            let total = peer.subscription_count();
            let set = match name.as_str() {
                "SUBSCRIBE" | "UNSUBSCRIBE" => &mut peer.channels,
                "PSUBSCRIBE" | "PUNSUBSCRIBE" => &mut peer.patterns,
                _ => &mut peer.shards,
            };
            let others = total - set.len();
            let names: Vec<Bytes> = if !subscribe && args.len() == 1 {
                set.iter().cloned().collect()
            } else {
                args[1..].to_vec()
            };
            let mut acks = Vec::with_capacity(names.len());
            for n in names {
                if subscribe {
                    set.insert(n.clone());
                } else {
                    set.remove(&n);
                }
                acks.push((n, others + set.len()));
            }
            for (n, count) in acks {
                peer.push(vec![bulk(&tag), bulk(&n), RespFrame::Integer(count as i64)]);
            }
            // Acks were pushed directly; nothing else to reply.
            Vec::new()
        }
        other => vec![err(&format!("ERR unknown command '{other}'"))],
    }
}

fn client_command(shared: &mut Shared, id: u64, args: &[Bytes]) -> Vec<RespFrame> {
    let sub = args.get(1).map(|a| text(a).to_ascii_uppercase()).unwrap_or_default();
    match sub.as_str() {
        "ID" => vec![RespFrame::Integer(id as i64)],
        "SETNAME" => {
            if let Some(peer) = shared.peers.get_mut(&id) {
                peer.name = args.get(2).map(text);
            }
            vec![ok()]
        }
        "TRACKING" => {
            let on = args
                .get(2)
                .is_some_and(|a| a.eq_ignore_ascii_case(b"ON"));
            let mut redirect = None;
            let mut bcast = None;
            let mut i = 3;
            while i < args.len() {
                match text(&args[i]).to_ascii_uppercase().as_str() {
                    "REDIRECT" => {
                        redirect = args.get(i + 1).and_then(|a| text(a).parse::<u64>().ok());
                        i += 2;
                    }
                    "BCAST" => {
                        bcast.get_or_insert_with(Vec::new);
                        i += 1;
                    }
                    "PREFIX" => {
                        if let Some(p) = args.get(i + 1) {
                            bcast.get_or_insert_with(Vec::new).push(p.clone());
                        }
                        i += 2;
                    }
                    _ => i += 1,
                }
            }
            if let Some(target) = redirect
                && !shared.peers.contains_key(&target)
            {
                return vec![err("ERR The client ID you want redirect to does not exist")];
            }
            if let Some(peer) = shared.peers.get_mut(&id) {
                if on {
                    peer.redirect = redirect;
                    peer.bcast = bcast;
                } else {
                    peer.redirect = None;
                    peer.bcast = None;
                }
            }
            vec![ok()]
        }
        _ => vec![err("ERR unknown CLIENT subcommand")],
    }
}
