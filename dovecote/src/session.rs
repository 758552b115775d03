//! Client sessions.
//!
//! One session per accepted TCP connection. The session owns its parser
//! state, its sid-keyed subscription map, and a buffered writer over the
//! write half of the stream. Publishes originate here: the read loop
//! parses a batch of operations, deliveries append into the *target*
//! sessions' writers under their locks, and the batch ends by flushing
//! every writer this session touched — amortizing write syscalls across
//! all subscribers of all publishes in the batch.
//!
//! Locking: a session's mutable state sits behind a single async mutex.
//! Delivery acquires exactly one target lock at a time and the originator
//! never holds its own lock while delivering, so lock order is trivially
//! acyclic. No lock is held across socket reads.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hashbrown::HashMap;
use rand::Rng;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

use dovecote_core::error::{DovecoteError, Result};
use dovecote_core::options::BUF_SIZE;
use dovecote_core::subject;

use crate::hub::Hub;
use crate::parser::{Op, Parser, PubOp};

pub(crate) const CR_LF: &[u8] = b"\r\n";

/// Options a client supplies in its `CONNECT` line. Unknown fields are
/// ignored; absent fields keep the pre-CONNECT defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectOpts {
    /// Ack every operation with `+OK`
    pub verbose: bool,
    /// Validate publish subjects strictly
    pub pedantic: bool,
    /// Advisory only; the broker speaks plaintext
    pub ssl_required: bool,
    pub auth_token: Option<String>,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub name: Option<String>,
}

impl Default for ConnectOpts {
    fn default() -> Self {
        // Until CONNECT arrives a client is treated as verbose and pedantic.
        Self {
            verbose: true,
            pedantic: true,
            ssl_required: false,
            auth_token: None,
            user: None,
            pass: None,
            name: None,
        }
    }
}

/// A registered interest in subjects matching a pattern.
///
/// Owned by exactly one session through its sid-map; the index holds
/// non-owning clones that delivery skips once the owner is gone.
#[derive(Debug)]
pub struct Subscription {
    pub(crate) session: Weak<Session>,
    pub subject: Bytes,
    pub queue: Option<Bytes>,
    pub sid: Bytes,
    /// Messages delivered so far
    delivered: AtomicI64,
    /// Auto-unsubscribe after this many deliveries; 0 = unlimited
    max: AtomicI64,
}

/// Counters a session keeps for itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub in_msgs: u64,
    pub in_bytes: u64,
    pub out_msgs: u64,
    pub out_bytes: u64,
}

struct SessionInner {
    /// Write half; `None` once the connection is closed
    writer: Option<OwnedWriteHalf>,
    /// Buffered outbound bytes awaiting flush
    wbuf: BytesMut,
    /// Subscriptions owned by this session, keyed by sid
    subs: HashMap<Bytes, Arc<Subscription>>,
    opts: ConnectOpts,
    authed: bool,
    /// Pings sent without an answering PONG
    pout: i32,
    stats: SessionStats,
}

/// Sessions this session has written into since its last flush, keyed by
/// client id. Cleared at every read-batch boundary.
type PendingFlush = HashMap<u64, Arc<Session>>;

/// Per-connection state: identity, writer, subscriptions, timers.
pub struct Session {
    cid: u64,
    hub: Weak<Hub>,
    closed: AtomicBool,
    close_notify: Notify,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub(crate) fn new(cid: u64, hub: &Arc<Hub>, writer: OwnedWriteHalf, authed: bool) -> Arc<Self> {
        Arc::new(Self {
            cid,
            hub: Arc::downgrade(hub),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            inner: Mutex::new(SessionInner {
                writer: Some(writer),
                wbuf: BytesMut::with_capacity(BUF_SIZE),
                subs: HashMap::new(),
                opts: ConnectOpts::default(),
                authed,
                pout: 0,
                stats: SessionStats::default(),
            }),
        })
    }

    #[must_use]
    pub fn cid(&self) -> u64 {
        self.cid
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of this session's counters.
    pub async fn stats(&self) -> SessionStats {
        self.inner.lock().await.stats
    }

    /// Drive the connection: banner, timers, then the read loop until the
    /// peer goes away or the session is closed.
    pub(crate) async fn run(self: Arc<Self>, mut reader: OwnedReadHalf) {
        let Some(hub) = self.hub.upgrade() else { return };
        let flush_deadline = hub.options().flush_deadline;

        if self
            .enqueue_and_flush(&hub.info_line(), flush_deadline)
            .await
            .is_err()
        {
            self.close_connection().await;
            return;
        }
        if hub.auth_required() {
            self.spawn_auth_timer(hub.options().auth_timeout, flush_deadline);
        }
        self.spawn_ping_timer(
            hub.options().ping_interval,
            hub.options().max_pings_out,
            flush_deadline,
        );

        let mut parser = Parser::new(hub.options().max_payload);
        let mut buf = vec![0u8; BUF_SIZE];
        let mut ops: Vec<Op> = Vec::new();
        let mut pending: PendingFlush = HashMap::new();

        'read: loop {
            let n = tokio::select! {
                res = reader.read(&mut buf) => match res {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!(cid = self.cid, error = %e, "read error");
                        break;
                    }
                },
                _ = self.close_notify.notified() => break,
            };

            ops.clear();
            if let Err(e) = parser.parse(&buf[..n], &mut ops) {
                info!(cid = self.cid, error = %e, "protocol error");
                let _ = self.send_err_now(e.wire_reason(), flush_deadline).await;
                break;
            }
            for op in ops.drain(..) {
                if let Err(e) = self.dispatch(&hub, op, &mut pending, flush_deadline).await {
                    if !matches!(e, DovecoteError::Authorization) {
                        let _ = self.send_err_now("Parser Error", flush_deadline).await;
                    }
                    break 'read;
                }
            }
            self.flush_pending(&mut pending, flush_deadline).await;

            // A publish in this batch may have classified us as slow.
            if self.is_closed() {
                break;
            }
        }
        self.close_connection().await;
    }

    async fn dispatch(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        op: Op,
        pending: &mut PendingFlush,
        deadline: Duration,
    ) -> Result<()> {
        match op {
            Op::Connect(arg) => self.on_connect(hub, &arg, pending).await,
            Op::Pub(op) => {
                self.on_pub(hub, op, pending, deadline).await;
                Ok(())
            }
            Op::Sub { subject, queue, sid } => {
                self.on_sub(hub, subject, queue, sid, pending).await;
                Ok(())
            }
            Op::Unsub { sid, max } => {
                self.on_unsub(hub, &sid, max, pending).await;
                Ok(())
            }
            Op::Ping => {
                self.on_ping(deadline).await;
                Ok(())
            }
            Op::Pong => {
                self.on_pong().await;
                Ok(())
            }
        }
    }

    async fn on_connect(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        arg: &[u8],
        pending: &mut PendingFlush,
    ) -> Result<()> {
        trace!(cid = self.cid, arg = %String::from_utf8_lossy(arg), "CONNECT");
        let opts: ConnectOpts = serde_json::from_slice(arg)
            .map_err(|e| DovecoteError::protocol(format!("malformed CONNECT options: {e}")))?;
        if !hub.check_auth(&opts) {
            warn!(cid = self.cid, "authorization violation");
            let err = DovecoteError::Authorization;
            let _ = self
                .send_err_now(&err.to_string(), hub.options().flush_deadline)
                .await;
            return Err(err);
        }
        let verbose = opts.verbose;
        if let Some(name) = &opts.name {
            debug!(cid = self.cid, name = %name, "client identified");
        }
        {
            let mut inner = self.inner.lock().await;
            inner.opts = opts;
            // Marks the auth deadline satisfied; a concurrently firing
            // auth timer observes this and becomes a no-op.
            inner.authed = true;
        }
        if verbose {
            self.send_ok(pending).await;
        }
        Ok(())
    }

    async fn on_pub(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        op: PubOp,
        pending: &mut PendingFlush,
        deadline: Duration,
    ) {
        let PubOp {
            subject,
            reply,
            szb,
            payload,
        } = op;
        trace!(
            cid = self.cid,
            subject = %String::from_utf8_lossy(&subject),
            size = payload.len(),
            "PUB"
        );

        let (verbose, pedantic) = {
            let mut inner = self.inner.lock().await;
            inner.stats.in_msgs += 1;
            inner.stats.in_bytes += payload.len() as u64;
            (inner.opts.verbose, inner.opts.pedantic)
        };
        hub.record_in(payload.len());

        if verbose {
            self.send_ok(pending).await;
        }
        if pedantic && !subject::is_valid_literal_subject(&subject) {
            // Soft failure: warn the client, deliver anyway.
            self.send_err(pending, &DovecoteError::InvalidSubject.to_string())
                .await;
        }

        let matched = hub.sublist().match_subject(&subject);
        if matched.is_empty() {
            return;
        }

        // The subject part of the MSG header is shared by every recipient;
        // only the suffix after `split` is rebuilt per subscriber.
        let mut mh = BytesMut::with_capacity(64 + subject.len());
        mh.extend_from_slice(b"MSG ");
        mh.extend_from_slice(&subject);
        mh.extend_from_slice(b" ");
        let split = mh.len();

        for sub in &matched.psubs {
            msg_header(&mut mh, split, sub, reply.as_deref(), &szb);
            self.deliver_msg(hub, sub, &mh, &payload, pending, deadline)
                .await;
        }
        for qsubs in matched.qsubs.values() {
            let index = rand::thread_rng().gen_range(0..qsubs.len());
            let sub = &qsubs[index];
            msg_header(&mut mh, split, sub, reply.as_deref(), &szb);
            self.deliver_msg(hub, sub, &mh, &payload, pending, deadline)
                .await;
        }
    }

    /// Write one message into `sub`'s owning session.
    ///
    /// The target lock is taken after the originator has released its own;
    /// a writer that cannot absorb the message without exceeding its
    /// buffer is drained in place under the flush deadline, and a deadline
    /// miss classifies the target as a slow consumer.
    async fn deliver_msg(
        &self,
        hub: &Arc<Hub>,
        sub: &Arc<Subscription>,
        header: &[u8],
        payload: &[u8],
        pending: &mut PendingFlush,
        deadline: Duration,
    ) {
        let Some(target) = sub.session.upgrade() else {
            return;
        };
        if target.is_closed() {
            return;
        }

        let delivered = sub.delivered.fetch_add(1, Ordering::Relaxed) + 1;
        let max = sub.max.load(Ordering::Relaxed);
        if max > 0 && delivered > max {
            target.unsubscribe(hub, sub).await;
            return;
        }

        let mut inner = target.inner.lock().await;
        if inner.writer.is_none() {
            return;
        }
        inner.stats.out_msgs += 1;
        inner.stats.out_bytes += payload.len() as u64;
        hub.record_out(payload.len());

        inner.wbuf.extend_from_slice(header);
        inner.wbuf.extend_from_slice(payload);
        inner.wbuf.extend_from_slice(CR_LF);

        if inner.wbuf.len() >= BUF_SIZE {
            match flush_inner(&mut inner, deadline).await {
                Ok(()) => {}
                Err(DovecoteError::SlowConsumer) => {
                    drop(inner);
                    info!(cid = target.cid, "slow consumer detected");
                    pending.remove(&target.cid);
                    target.close_connection().await;
                    return;
                }
                Err(e) => {
                    debug!(cid = target.cid, error = %e, "error writing msg");
                }
            }
        }
        drop(inner);
        pending.insert(target.cid, target);
    }

    async fn on_sub(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        subject: Bytes,
        queue: Option<Bytes>,
        sid: Bytes,
        pending: &mut PendingFlush,
    ) {
        trace!(
            cid = self.cid,
            subject = %String::from_utf8_lossy(&subject),
            sid = %String::from_utf8_lossy(&sid),
            "SUB"
        );
        let sub = Arc::new(Subscription {
            session: Arc::downgrade(self),
            subject: subject.clone(),
            queue: queue.clone(),
            sid: sid.clone(),
            delivered: AtomicI64::new(0),
            max: AtomicI64::new(0),
        });

        let (replaced, verbose) = {
            let mut inner = self.inner.lock().await;
            (inner.subs.insert(sid, sub.clone()), inner.opts.verbose)
        };
        // Reusing a sid drops the previous subscription.
        if let Some(old) = replaced {
            hub.sublist().remove(&old.subject, old.queue.as_deref(), &old);
        }

        if let Err(e) = hub.sublist().insert(&subject, queue.as_deref(), sub.clone()) {
            let mut inner = self.inner.lock().await;
            inner.subs.remove(&sub.sid);
            drop(inner);
            self.send_err(pending, &e.to_string()).await;
        } else if verbose {
            self.send_ok(pending).await;
        }
    }

    async fn on_unsub(
        self: &Arc<Self>,
        hub: &Arc<Hub>,
        sid: &Bytes,
        max: Option<usize>,
        pending: &mut PendingFlush,
    ) {
        trace!(cid = self.cid, sid = %String::from_utf8_lossy(sid), "UNSUB");
        let (sub, verbose) = {
            let inner = self.inner.lock().await;
            (inner.subs.get(sid).cloned(), inner.opts.verbose)
        };
        if let Some(sub) = sub {
            match max {
                Some(m) if m > 0 => {
                    // Leave the subscription installed; delivery removes it
                    // on the transition past `max`.
                    sub.max.store(m as i64, Ordering::Relaxed);
                    self.unsubscribe(hub, &sub).await;
                }
                _ => self.remove_sub(hub, &sub).await,
            }
        }
        if verbose {
            self.send_ok(pending).await;
        }
    }

    /// Remove `sub` unless its auto-unsubscribe limit is set and unmet.
    pub(crate) async fn unsubscribe(&self, hub: &Arc<Hub>, sub: &Arc<Subscription>) {
        let max = sub.max.load(Ordering::Relaxed);
        if max > 0 && sub.delivered.load(Ordering::Relaxed) <= max {
            return;
        }
        self.remove_sub(hub, sub).await;
    }

    async fn remove_sub(&self, hub: &Arc<Hub>, sub: &Arc<Subscription>) {
        trace!(
            cid = self.cid,
            sid = %String::from_utf8_lossy(&sub.sid),
            "removing subscription"
        );
        {
            let mut inner = self.inner.lock().await;
            inner.subs.remove(&sub.sid);
        }
        hub.sublist().remove(&sub.subject, sub.queue.as_deref(), sub);
    }

    async fn on_ping(&self, deadline: Duration) {
        trace!(cid = self.cid, "PING");
        if let Err(e) = self.enqueue_and_flush(b"PONG\r\n", deadline).await {
            debug!(cid = self.cid, error = %e, "error on flush");
            self.close_connection().await;
        }
    }

    async fn on_pong(&self) {
        trace!(cid = self.cid, "PONG");
        let mut inner = self.inner.lock().await;
        inner.pout -= 1;
    }

    async fn send_ok(self: &Arc<Self>, pending: &mut PendingFlush) {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_some() {
            inner.wbuf.extend_from_slice(b"+OK\r\n");
            drop(inner);
            pending.insert(self.cid, self.clone());
        }
    }

    async fn send_err(self: &Arc<Self>, pending: &mut PendingFlush, reason: &str) {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_some() {
            inner
                .wbuf
                .extend_from_slice(format!("-ERR '{reason}'\r\n").as_bytes());
            drop(inner);
            pending.insert(self.cid, self.clone());
        }
    }

    /// Queue an error line and flush it immediately; used on paths that
    /// bypass the batch (parse failures, timers).
    async fn send_err_now(&self, reason: &str, deadline: Duration) -> Result<()> {
        self.enqueue_and_flush(format!("-ERR '{reason}'\r\n").as_bytes(), deadline)
            .await
    }

    pub(crate) async fn enqueue_and_flush(&self, bytes: &[u8], deadline: Duration) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.writer.is_none() {
            return Err(DovecoteError::ConnectionClosed);
        }
        inner.wbuf.extend_from_slice(bytes);
        flush_inner(&mut inner, deadline).await
    }

    /// Flush every writer touched during the read batch, each under its
    /// own lock with the bounded write deadline.
    async fn flush_pending(&self, pending: &mut PendingFlush, deadline: Duration) {
        for (_, target) in pending.drain() {
            let mut inner = target.inner.lock().await;
            match flush_inner(&mut inner, deadline).await {
                Ok(()) => {}
                Err(DovecoteError::SlowConsumer) => {
                    drop(inner);
                    info!(cid = target.cid, "slow consumer detected");
                    target.close_connection().await;
                }
                Err(e) => {
                    drop(inner);
                    debug!(cid = target.cid, error = %e, "error flushing");
                    target.close_connection().await;
                }
            }
        }
    }

    fn spawn_auth_timer(self: &Arc<Self>, timeout: Duration, deadline: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(session) = weak.upgrade() else { return };
            if session.is_closed() {
                return;
            }
            let authed = session.inner.lock().await.authed;
            if !authed {
                warn!(cid = session.cid, "authorization timeout");
                let _ = session
                    .send_err_now(&DovecoteError::Authorization.to_string(), deadline)
                    .await;
                session.close_connection().await;
            }
        });
    }

    fn spawn_ping_timer(self: &Arc<Self>, interval: Duration, max_out: i32, deadline: Duration) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(session) = weak.upgrade() else { return };
                if session.is_closed() {
                    return;
                }
                let stale = {
                    let mut inner = session.inner.lock().await;
                    inner.pout += 1;
                    inner.pout > max_out
                };
                if stale {
                    debug!(cid = session.cid, "stale connection, closing");
                    let _ = session
                        .send_err_now(&DovecoteError::StaleConnection.to_string(), deadline)
                        .await;
                    session.close_connection().await;
                    return;
                }
                trace!(cid = session.cid, "ping timer");
                if session.enqueue_and_flush(b"PING\r\n", deadline).await.is_err() {
                    session.close_connection().await;
                    return;
                }
            }
        });
    }

    /// Drain the sid-map on termination; the hub unhooks each entry from
    /// the index.
    pub(crate) async fn drain_subs(&self) -> Vec<Arc<Subscription>> {
        let mut inner = self.inner.lock().await;
        inner.subs.drain().map(|(_, sub)| sub).collect()
    }

    /// Terminate the session. Idempotent; safe to call from the read
    /// loop, delivery, timers, or another session's flush.
    pub async fn close_connection(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(cid = self.cid, "client connection closed");
        // Stored-permit notify: the read loop observes this even if it is
        // not parked in select yet.
        self.close_notify.notify_one();

        let deadline = self
            .hub
            .upgrade()
            .map_or(Duration::from_secs(2), |h| h.options().flush_deadline);
        {
            let mut inner = self.inner.lock().await;
            let _ = flush_inner(&mut inner, deadline).await;
            if let Some(mut writer) = inner.writer.take() {
                let _ = writer.shutdown().await;
            }
        }
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_session(self).await;
        }
    }
}

/// Rebuild the per-subscriber header suffix after the shared prefix.
fn msg_header(mh: &mut BytesMut, split: usize, sub: &Subscription, reply: Option<&[u8]>, szb: &[u8]) {
    mh.truncate(split);
    mh.extend_from_slice(&sub.sid);
    mh.extend_from_slice(b" ");
    if let Some(reply) = reply {
        mh.extend_from_slice(reply);
        mh.extend_from_slice(b" ");
    }
    mh.extend_from_slice(szb);
    mh.extend_from_slice(CR_LF);
}

/// Write out the buffered bytes under the flush deadline.
///
/// A missed deadline classifies the owner as a slow consumer; any other
/// write failure surfaces as the underlying IO error.
async fn flush_inner(inner: &mut SessionInner, deadline: Duration) -> Result<()> {
    if inner.wbuf.is_empty() {
        return Ok(());
    }
    let buf = inner.wbuf.split();
    let Some(writer) = inner.writer.as_mut() else {
        return Ok(());
    };
    match tokio::time::timeout(deadline, writer.write_all(&buf)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(DovecoteError::Io(e)),
        Err(_) => Err(DovecoteError::SlowConsumer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_opts_defaults() {
        let opts: ConnectOpts = serde_json::from_str("{}").unwrap();
        assert!(opts.verbose);
        assert!(opts.pedantic);
        assert!(opts.user.is_none());
    }

    #[test]
    fn test_connect_opts_partial_override() {
        let opts: ConnectOpts =
            serde_json::from_str("{\"verbose\":false,\"name\":\"tester\"}").unwrap();
        assert!(!opts.verbose);
        assert!(opts.pedantic);
        assert_eq!(opts.name.as_deref(), Some("tester"));
    }

    #[test]
    fn test_connect_opts_ignores_unknown_fields() {
        let opts: ConnectOpts =
            serde_json::from_str("{\"verbose\":false,\"lang\":\"rust\",\"protocol\":1}").unwrap();
        assert!(!opts.verbose);
    }

    #[test]
    fn test_msg_header_layout() {
        let sub = Subscription {
            session: Weak::new(),
            subject: Bytes::from_static(b"foo"),
            queue: None,
            sid: Bytes::from_static(b"9"),
            delivered: AtomicI64::new(0),
            max: AtomicI64::new(0),
        };
        let mut mh = BytesMut::new();
        mh.extend_from_slice(b"MSG foo ");
        let split = mh.len();

        msg_header(&mut mh, split, &sub, None, b"5");
        assert_eq!(&mh[..], b"MSG foo 9 5\r\n" as &[u8]);

        msg_header(&mut mh, split, &sub, Some(b"inbox.1"), b"5");
        assert_eq!(&mh[..], b"MSG foo 9 inbox.1 5\r\n" as &[u8]);
    }
}
