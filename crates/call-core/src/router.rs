//! The (service, Call-ID) router and the public stack surface.
//!
//! The router keeps a sharded map from Call-ID to a live call actor, spawns
//! actors on first reference with a snapshot of the service configuration,
//! and enforces `max_calls`. Synchronous submissions are bounded by
//! `sync_call_time`.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use sipflow_auth_core::NonceStore;
use sipflow_registrar_core::Registrar;
use sipflow_sip_core::{DialogId, Method, Request, Response, SipMessage, StatusCode};
use sipflow_sip_transport::Transport;

use crate::call::{Call, CallDeps, CallInfo, CallMsg, DialogInfo, WorkItem};
use crate::config::{Plugin, ServiceConfig};
use crate::error::{Error, Result};
use crate::handler::{ServiceHandler, SipReply};
use crate::trans::{RequestOpts, TransId};

const MAILBOX_CAPACITY: usize = 64;

struct StackInner {
    config: Arc<ServiceConfig>,
    handler: Arc<dyn ServiceHandler>,
    transport: Arc<dyn Transport>,
    registrar: Option<Arc<Registrar>>,
    nonces: Arc<NonceStore>,
    cseq: Arc<AtomicU32>,
    shards: Vec<DashMap<String, mpsc::Sender<CallMsg>>>,
    call_count: AtomicUsize,
}

/// One running SIP service: configuration, handler, transport and the call
/// router.
#[derive(Clone)]
pub struct SipStack {
    inner: Arc<StackInner>,
}

/// A launched client transaction: where it lives and where its responses
/// arrive.
#[derive(Debug)]
pub struct RequestHandle {
    pub call_id: String,
    pub trans: TransId,
    pub responses: mpsc::UnboundedReceiver<Response>,
    request: Option<Request>,
}

impl SipStack {
    pub fn new(
        config: ServiceConfig,
        handler: Arc<dyn ServiceHandler>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let registrar = config.has_plugin(Plugin::Registrar).then(|| {
            Arc::new(Registrar::new(
                config.name.clone(),
                transport.registry().clone(),
            ))
        });
        let shards = (0..config.router_shards()).map(|_| DashMap::new()).collect();
        // The CSeq seed is process-wide state; seeded once here, bumped for
        // every originated request.
        let seed: u32 = rand::thread_rng().gen_range(1..0x0010_0000);
        SipStack {
            inner: Arc::new(StackInner {
                config: Arc::new(config),
                handler,
                transport,
                registrar,
                nonces: Arc::new(NonceStore::new()),
                cseq: Arc::new(AtomicU32::new(seed)),
                shards,
                call_count: AtomicUsize::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn registrar(&self) -> Option<&Arc<Registrar>> {
        self.inner.registrar.as_ref()
    }

    pub fn nonces(&self) -> &Arc<NonceStore> {
        &self.inner.nonces
    }

    /// Pump parsed inbound messages from a transport receiver into the
    /// router.
    pub fn spawn_receiver(&self, mut rx: mpsc::Receiver<SipMessage>) {
        let stack = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(err) = stack.incoming(msg).await {
                    warn!(%err, "dropping inbound message");
                }
            }
        });
    }

    /// Deliver one parsed inbound message.
    pub async fn incoming(&self, msg: SipMessage) -> Result<()> {
        let call_id = msg.call_id().to_string();
        if call_id.is_empty() {
            return Err(Error::Invalid("Call-ID"));
        }
        self.send_work(&call_id, WorkItem::Incoming(msg)).await
    }

    /// Send a request and wait for its final response.
    pub async fn request(&self, request: Request, opts: RequestOpts) -> Result<Response> {
        let handle = self.request_with_events(request, opts).await?;
        self.wait_final(handle).await
    }

    /// Send a request, returning a handle that yields provisional and final
    /// responses in order.
    pub async fn request_with_events(
        &self,
        mut request: Request,
        opts: RequestOpts,
    ) -> Result<RequestHandle> {
        if request.call_id.is_empty() {
            request.call_id = new_call_id();
        }
        let call_id = request.call_id.clone();
        let (sink, responses) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        let stored = request.clone();
        self.send_work(
            &call_id,
            WorkItem::SendRequest {
                request,
                opts,
                sink,
                done,
            },
        )
        .await?;
        let trans = timeout(self.inner.config.sync_call_time, done_rx)
            .await
            .map_err(|_| Error::SyncCallTimeout)?
            .map_err(|_| Error::CallTerminated)??;
        Ok(RequestHandle {
            call_id,
            trans,
            responses,
            request: Some(stored),
        })
    }

    /// Wait for the final response on a handle. A crashed call yields a
    /// synthetic 500 Internal Error, matching what in-flight callers are
    /// promised.
    pub async fn wait_final(&self, mut handle: RequestHandle) -> Result<Response> {
        loop {
            match timeout(self.inner.config.sync_call_time, handle.responses.recv()).await {
                Err(_) => return Err(Error::SyncCallTimeout),
                Ok(None) => {
                    // The actor died under the caller: promise kept with a
                    // synthetic 500 Internal Error.
                    return match &handle.request {
                        Some(request) => {
                            Ok(Response::to_request(request, StatusCode::INTERNAL_ERROR))
                        }
                        None => Err(Error::CallTerminated),
                    };
                }
                Ok(Some(response)) if response.status.is_final() => return Ok(response),
                Ok(Some(_provisional)) => continue,
            }
        }
    }

    /// Cancel a pending INVITE launched through this stack.
    pub async fn cancel(&self, handle: &RequestHandle) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.send_work(
            &handle.call_id,
            WorkItem::SendCancel {
                trans: handle.trans,
                done,
            },
        )
        .await?;
        timeout(self.inner.config.sync_call_time, done_rx)
            .await
            .map_err(|_| Error::SyncCallTimeout)?
            .map_err(|_| Error::CallTerminated)?
    }

    /// Answer a pending server transaction (one the handler deferred).
    pub async fn reply(&self, call_id: &str, trans: TransId, reply: SipReply) -> Result<()> {
        let (done, done_rx) = oneshot::channel();
        self.send_work(call_id, WorkItem::SendReply { trans, reply, done })
            .await?;
        timeout(self.inner.config.sync_call_time, done_rx)
            .await
            .map_err(|_| Error::SyncCallTimeout)?
            .map_err(|_| Error::CallTerminated)?
    }

    /// Send an in-dialog request and wait for its final response.
    pub async fn in_dialog(
        &self,
        dialog: DialogId,
        method: Method,
        body: Option<(String, bytes::Bytes)>,
    ) -> Result<Response> {
        let call_id = dialog.call_id.clone();
        let (sink, responses) = mpsc::unbounded_channel();
        let (done, done_rx) = oneshot::channel();
        self.send_work(
            &call_id,
            WorkItem::SendInDialog {
                dialog,
                method,
                body,
                sink,
                done,
            },
        )
        .await?;
        let trans = timeout(self.inner.config.sync_call_time, done_rx)
            .await
            .map_err(|_| Error::SyncCallTimeout)?
            .map_err(|_| Error::CallTerminated)??;
        let handle = RequestHandle {
            call_id,
            trans,
            responses,
            request: None,
        };
        self.wait_final(handle).await
    }

    /// Tear a dialog down locally.
    pub async fn stop_dialog(&self, dialog: DialogId) -> Result<()> {
        let call_id = dialog.call_id.clone();
        let (done, done_rx) = oneshot::channel();
        self.send_work(&call_id, WorkItem::StopDialog { id: dialog, done })
            .await?;
        timeout(self.inner.config.sync_call_time, done_rx)
            .await
            .map_err(|_| Error::SyncCallTimeout)?
            .map_err(|_| Error::CallTerminated)?
    }

    /// Read-only call snapshot; `None` when no actor is live for the id.
    pub async fn call_info(&self, call_id: &str) -> Option<CallInfo> {
        let tx = self.existing(call_id)?;
        let (reply, rx) = oneshot::channel();
        tx.send(CallMsg::Work(WorkItem::InspectCall { reply }))
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Read-only dialog snapshot.
    pub async fn dialog_info(&self, dialog: &DialogId) -> Option<DialogInfo> {
        let tx = self.existing(&dialog.call_id)?;
        let (reply, rx) = oneshot::channel();
        tx.send(CallMsg::Work(WorkItem::InspectDialog {
            id: dialog.clone(),
            reply,
        }))
        .await
        .ok()?;
        rx.await.ok().flatten()
    }

    /// Test only: make the actor die mid-call.
    pub async fn crash_call(&self, call_id: &str) -> Result<()> {
        self.send_work(call_id, WorkItem::Crash).await
    }

    /// Number of live call actors.
    pub fn call_count(&self) -> usize {
        self.inner.call_count.load(Ordering::Relaxed)
    }

    fn shard(&self, call_id: &str) -> &DashMap<String, mpsc::Sender<CallMsg>> {
        let mut hasher = DefaultHasher::new();
        call_id.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.inner.shards.len();
        &self.inner.shards[index]
    }

    fn existing(&self, call_id: &str) -> Option<mpsc::Sender<CallMsg>> {
        self.shard(call_id).get(call_id).map(|tx| tx.clone())
    }

    /// Deliver a work item, spawning the call actor on first reference.
    async fn send_work(&self, call_id: &str, item: WorkItem) -> Result<()> {
        let mut msg = CallMsg::Work(item);
        loop {
            let tx = match self.existing(call_id) {
                Some(tx) => tx,
                None => self.spawn_call(call_id)?,
            };
            match tx.send(msg).await {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(back)) => {
                    // The actor finished between lookup and send; retry on a
                    // fresh one.
                    self.shard(call_id)
                        .remove_if(call_id, |_, sender| sender.is_closed());
                    msg = back;
                }
            }
        }
    }

    fn spawn_call(&self, call_id: &str) -> Result<mpsc::Sender<CallMsg>> {
        if self.inner.call_count.load(Ordering::Relaxed) >= self.inner.config.max_calls {
            return Err(Error::TooManyCalls);
        }
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let deps = CallDeps {
            config: self.inner.config.clone(),
            handler: self.inner.handler.clone(),
            transport: self.inner.transport.clone(),
            registrar: self.inner.registrar.clone(),
            nonces: self.inner.nonces.clone(),
            cseq: self.inner.cseq.clone(),
        };
        let call = Call::new(call_id.to_string(), deps, tx.clone());
        self.shard(call_id).insert(call_id.to_string(), tx.clone());
        self.inner.call_count.fetch_add(1, Ordering::Relaxed);
        debug!(call = call_id, "spawning call actor");

        let inner = self.inner.clone();
        let key = call_id.to_string();
        tokio::spawn(async move {
            call.run(rx).await;
            let stack = SipStack { inner };
            stack.shard(&key).remove_if(&key, |_, sender| sender.is_closed());
            stack.inner.call_count.fetch_sub(1, Ordering::Relaxed);
        });
        Ok(tx)
    }
}

/// A fresh random Call-ID.
pub fn new_call_id() -> String {
    let n: u128 = rand::thread_rng().gen();
    format!("{:032x}", n)
}
