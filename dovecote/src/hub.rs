//! Broker hub.
//!
//! Process-wide registry: owns the subject-match index, the set of active
//! sessions, the auth policy, and the global counters session writers
//! bump during delivery. The accept loop lives here too — one spawned
//! task per accepted connection.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};

use dovecote_core::options::ServerOptions;
use dovecote_core::sublist::Sublist;

use crate::session::{ConnectOpts, Session, Subscription};

/// Banner fields advertised to every client on accept.
#[derive(Debug, Serialize)]
struct ServerInfo<'a> {
    server_id: &'a str,
    version: &'a str,
    host: &'a str,
    port: u16,
    auth_required: bool,
    ssl_required: bool,
    max_payload: usize,
}

/// Process-wide counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
    pub connections: usize,
}

/// The broker hub. Create one, hand it a listener, and serve.
///
/// ```no_run
/// use dovecote::{Hub, ServerOptions};
/// use tokio::net::TcpListener;
///
/// #[tokio::main]
/// async fn main() -> std::io::Result<()> {
///     let hub = Hub::new(ServerOptions::default().with_port(4222));
///     let listener = TcpListener::bind(("0.0.0.0", 4222)).await?;
///     hub.serve(listener).await
/// }
/// ```
pub struct Hub {
    opts: ServerOptions,
    info_line: Bytes,
    sublist: Sublist<Subscription>,
    sessions: DashMap<u64, Arc<Session>>,
    next_cid: AtomicU64,
    in_msgs: AtomicU64,
    in_bytes: AtomicU64,
    out_msgs: AtomicU64,
    out_bytes: AtomicU64,
}

impl Hub {
    #[must_use]
    pub fn new(opts: ServerOptions) -> Arc<Self> {
        let server_id = random_id();
        let info = ServerInfo {
            server_id: &server_id,
            version: env!("CARGO_PKG_VERSION"),
            host: &opts.host,
            port: opts.port,
            auth_required: opts.auth_required(),
            ssl_required: false,
            max_payload: opts.max_payload,
        };
        let json = serde_json::to_string(&info).expect("INFO banner serializes");
        let mut line = BytesMut::with_capacity(json.len() + 8);
        line.put_slice(b"INFO ");
        line.put_slice(json.as_bytes());
        line.put_slice(b"\r\n");

        Arc::new(Self {
            opts,
            info_line: line.freeze(),
            sublist: Sublist::new(),
            sessions: DashMap::new(),
            next_cid: AtomicU64::new(0),
            in_msgs: AtomicU64::new(0),
            in_bytes: AtomicU64::new(0),
            out_msgs: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn options(&self) -> &ServerOptions {
        &self.opts
    }

    #[must_use]
    pub fn sublist(&self) -> &Sublist<Subscription> {
        &self.sublist
    }

    pub(crate) fn info_line(&self) -> Bytes {
        self.info_line.clone()
    }

    #[must_use]
    pub fn auth_required(&self) -> bool {
        self.opts.auth_required()
    }

    /// Gate a `CONNECT` against the configured credentials. Username and
    /// password take precedence over a token when both are configured.
    #[must_use]
    pub fn check_auth(&self, opts: &ConnectOpts) -> bool {
        if !self.auth_required() {
            return true;
        }
        if let Some(username) = &self.opts.username {
            return opts.user.as_deref() == Some(username.as_str())
                && opts.pass.as_deref() == self.opts.password.as_deref();
        }
        if let Some(token) = &self.opts.auth_token {
            return opts.auth_token.as_deref() == Some(token.as_str());
        }
        false
    }

    /// Number of currently registered sessions.
    #[must_use]
    pub fn num_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of the process-wide counters.
    #[must_use]
    pub fn stats(&self) -> HubStats {
        HubStats {
            in_msgs: self.in_msgs.load(Ordering::Relaxed),
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_msgs: self.out_msgs.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            connections: self.sessions.len(),
        }
    }

    pub(crate) fn record_in(&self, bytes: usize) {
        self.in_msgs.fetch_add(1, Ordering::Relaxed);
        self.in_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_out(&self, bytes: usize) {
        self.out_msgs.fetch_add(1, Ordering::Relaxed);
        self.out_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Accept connections forever, one session task each.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        info!(addr = %listener.local_addr()?, "listening for client connections");
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!(%addr, "accepted client connection");
            self.spawn_session(stream);
        }
    }

    /// Register a session for an accepted stream and start its read loop.
    pub fn spawn_session(self: &Arc<Self>, stream: TcpStream) -> Arc<Session> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = stream.into_split();
        // Sessions start authenticated when no credentials are configured.
        let session = Session::new(cid, self, writer, !self.auth_required());
        self.sessions.insert(cid, session.clone());
        tokio::spawn(session.clone().run(reader));
        session
    }

    /// Unhook a terminated session: drop it from the registry and remove
    /// each of its subscriptions from the index.
    pub(crate) async fn remove_session(&self, session: &Session) {
        self.sessions.remove(&session.cid());
        for sub in session.drain_subs().await {
            self.sublist.remove(&sub.subject, sub.queue.as_deref(), &sub);
        }
    }
}

fn random_id() -> String {
    let mut raw = [0u8; 8];
    rand::thread_rng().fill(&mut raw);
    raw.iter().map(|b| format!("{b:02X}")).collect()
}
