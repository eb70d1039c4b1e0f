//! etcd v3 client over gRPC.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       EtcdClient                          │
//! ├──────────────┬──────────────┬────────────┬───────────────┤
//! │  KV          │  Txn         │  Lease     │  Watch        │
//! │  Range/Put   │  guarded     │  TTL puts  │  bidi stream  │
//! │  DeleteRange │  put/delete  │            │  + progress   │
//! └──────────────┴──────────────┴────────────┴───────────────┘
//!                        │ tonic Channel (lazy, balanced)
//!                        ▼
//!                  etcd cluster endpoints
//! ```
//!
//! Construction never dials; the first request does. Guarded writes are a
//! single Txn comparing the key's version or mod revision, with a range of
//! the key on the failure branch so callers see the current value.

pub mod proto;

use super::tls::TlsFiles;
use super::{
    BackendConnector, BackendFuture, BackendWatch, Guard, KeyValue, KvBackend, PutRequest,
    RangeRequest, RangeResult, RawEvent, RawEventKind, TxnOutcome, WatchBatch, WatchRequest,
};
use crate::core::config::BackendConfig;
use crate::core::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::client::Grpc;
use tonic::codec::{ProstCodec, Streaming};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use tracing::{debug, trace, warn};

const RANGE: &str = "/etcdserverpb.KV/Range";
const PUT: &str = "/etcdserverpb.KV/Put";
const DELETE_RANGE: &str = "/etcdserverpb.KV/DeleteRange";
const TXN: &str = "/etcdserverpb.KV/Txn";
const LEASE_GRANT: &str = "/etcdserverpb.Lease/LeaseGrant";
const STATUS: &str = "/etcdserverpb.Maintenance/Status";
const WATCH: &str = "/etcdserverpb.Watch/Watch";

const WATCH_BUFFER: usize = 256;

/// Builds [`EtcdClient`]s from backend configuration.
#[derive(Debug, Clone)]
pub struct EtcdConnector {
    endpoints: Vec<String>,
    tls: TlsFiles,
    dial_timeout: Duration,
}

impl EtcdConnector {
    /// Resolve endpoints (falling back to `ETCD_SERVERS`) and TLS paths.
    pub fn from_config(config: &BackendConfig) -> StorageResult<Self> {
        let endpoints = config.resolved_endpoints();
        if endpoints.is_empty() {
            return Err(StorageError::construction(
                "no etcd endpoints configured and ETCD_SERVERS is empty",
            ));
        }
        Ok(Self {
            endpoints,
            tls: TlsFiles::from_config(config),
            dial_timeout: config.dial_timeout(),
        })
    }

    /// Configured endpoints.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

impl BackendConnector for EtcdConnector {
    fn connect(&self) -> StorageResult<Arc<dyn KvBackend>> {
        let client: Arc<dyn KvBackend> = Arc::new(EtcdClient::connect_lazy(
            &self.endpoints,
            &self.tls,
            self.dial_timeout,
        )?);
        Ok(client)
    }
}

/// One etcd client connection.
pub struct EtcdClient {
    channel: Channel,
    closed: AtomicBool,
    shutdown: CancellationToken,
    /// Request halves of open watch streams, for progress requests.
    watch_requests: Mutex<Vec<mpsc::Sender<proto::WatchRequest>>>,
}

impl EtcdClient {
    /// Build a client without dialing. Must be called inside a tokio runtime.
    pub fn connect_lazy(
        endpoints: &[String],
        tls: &TlsFiles,
        dial_timeout: Duration,
    ) -> StorageResult<Self> {
        let mut built = Vec::with_capacity(endpoints.len());
        for url in endpoints {
            let mut endpoint = Endpoint::from_shared(url.clone())
                .map_err(|e| StorageError::construction(format!("invalid endpoint {}: {}", url, e)))?
                .connect_timeout(dial_timeout);
            if url.starts_with("https://") || tls.is_configured() {
                endpoint = endpoint
                    .tls_config(tls.load(None)?)
                    .map_err(|e| StorageError::construction(format!("tls for {}: {}", url, e)))?;
            }
            built.push(endpoint);
        }

        let channel = match built.len() {
            0 => return Err(StorageError::construction("no etcd endpoints")),
            1 => built.remove(0).connect_lazy(),
            _ => Channel::balance_list(built.into_iter()),
        };
        debug!(endpoints = ?endpoints, "etcd client constructed");

        Ok(Self {
            channel,
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            watch_requests: Mutex::new(Vec::new()),
        })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::unavailable("etcd client is closed"));
        }
        Ok(())
    }

    async fn grpc(&self) -> StorageResult<Grpc<Channel>> {
        self.ensure_open()?;
        let mut grpc = Grpc::new(self.channel.clone());
        grpc.ready()
            .await
            .map_err(|e| StorageError::unavailable(format!("etcd not ready: {}", e)))?;
        Ok(grpc)
    }

    async fn unary<Req, Resp>(&self, path: &'static str, req: Req) -> StorageResult<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let mut grpc = self.grpc().await?;
        let codec: ProstCodec<Req, Resp> = ProstCodec::default();
        let response = grpc
            .unary(tonic::Request::new(req), PathAndQuery::from_static(path), codec)
            .await
            .map_err(status_to_error)?;
        Ok(response.into_inner())
    }

    async fn grant_lease(&self, ttl: Duration) -> StorageResult<i64> {
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        let resp: proto::LeaseGrantResponse = self
            .unary(
                LEASE_GRANT,
                proto::LeaseGrantRequest {
                    ttl: secs.max(1) as i64,
                    id: 0,
                },
            )
            .await?;
        if !resp.error.is_empty() {
            return Err(StorageError::unavailable(format!(
                "lease grant failed: {}",
                resp.error
            )));
        }
        Ok(resp.id)
    }

    async fn txn(
        &self,
        key: &str,
        guard: Guard,
        success: proto::request_op::Request,
    ) -> StorageResult<proto::TxnResponse> {
        let compare = match guard {
            Guard::None => Vec::new(),
            Guard::NotExists => vec![proto::Compare::not_exists(key)],
            Guard::ModRevision(rev) => vec![proto::Compare::mod_revision(key, rev as i64)],
        };
        let req = proto::TxnRequest {
            compare,
            success: vec![proto::RequestOp {
                request: Some(success),
            }],
            failure: vec![proto::RequestOp {
                request: Some(proto::request_op::Request::RequestRange(proto::RangeRequest {
                    key: key.as_bytes().to_vec(),
                    ..Default::default()
                })),
            }],
        };
        self.unary(TXN, req).await
    }

    async fn put_inner(&self, req: PutRequest) -> StorageResult<TxnOutcome> {
        let lease = match req.ttl {
            Some(ttl) => self.grant_lease(ttl).await?,
            None => 0,
        };
        let put = proto::PutRequest {
            key: req.key.as_bytes().to_vec(),
            value: req.value.clone(),
            lease,
            prev_kv: true,
        };

        let (succeeded, revision, prev, current) = match req.guard {
            Guard::None => {
                let resp: proto::PutResponse = self.unary(PUT, put).await?;
                (true, header_revision(&resp.header), resp.prev_kv, None)
            }
            guard => {
                let resp = self
                    .txn(&req.key, guard, proto::request_op::Request::RequestPut(put))
                    .await?;
                let revision = header_revision(&resp.header);
                let mut prev = None;
                let mut current = None;
                for op in resp.responses {
                    match op.response {
                        Some(proto::response_op::Response::ResponsePut(p)) => prev = p.prev_kv,
                        Some(proto::response_op::Response::ResponseRange(r)) => {
                            current = r.kvs.into_iter().next()
                        }
                        _ => {}
                    }
                }
                (resp.succeeded, revision, prev, current)
            }
        };

        if !succeeded {
            return Ok(TxnOutcome {
                succeeded,
                revision,
                kv: current.map(convert_kv),
            });
        }
        let prev = prev.map(convert_kv);
        Ok(TxnOutcome {
            succeeded,
            revision,
            kv: Some(KeyValue {
                key: req.key,
                value: req.value,
                create_revision: prev.as_ref().map_or(revision, |p| p.create_revision),
                mod_revision: revision,
                version: prev.as_ref().map_or(1, |p| p.version + 1),
            }),
        })
    }

    async fn delete_inner(&self, key: String, guard: Guard) -> StorageResult<TxnOutcome> {
        let delete = proto::DeleteRangeRequest {
            key: key.as_bytes().to_vec(),
            range_end: Vec::new(),
            prev_kv: true,
        };
        if guard == Guard::None {
            let resp: proto::DeleteRangeResponse = self.unary(DELETE_RANGE, delete).await?;
            return Ok(TxnOutcome {
                succeeded: resp.deleted > 0,
                revision: header_revision(&resp.header),
                kv: resp.prev_kvs.into_iter().next().map(convert_kv),
            });
        }

        let resp = self
            .txn(&key, guard, proto::request_op::Request::RequestDeleteRange(delete))
            .await?;
        let revision = header_revision(&resp.header);
        let mut kv = None;
        let mut deleted = 0;
        for op in resp.responses {
            match op.response {
                Some(proto::response_op::Response::ResponseDeleteRange(d)) => {
                    deleted = d.deleted;
                    kv = d.prev_kvs.into_iter().next();
                }
                Some(proto::response_op::Response::ResponseRange(r)) => {
                    kv = r.kvs.into_iter().next();
                }
                _ => {}
            }
        }
        Ok(TxnOutcome {
            succeeded: resp.succeeded && deleted > 0,
            revision,
            kv: kv.map(convert_kv),
        })
    }

    async fn watch_inner(&self, req: WatchRequest) -> StorageResult<BackendWatch> {
        let mut grpc = self.grpc().await?;
        let (req_tx, req_rx) = mpsc::channel::<proto::WatchRequest>(8);
        let create = proto::WatchRequest {
            request_union: Some(proto::watch_request::RequestUnion::CreateRequest(
                proto::WatchCreateRequest {
                    key: req.prefix.as_bytes().to_vec(),
                    range_end: proto::prefix_range_end(req.prefix.as_bytes()),
                    start_revision: req.start_revision as i64,
                    progress_notify: req.progress_notify,
                    prev_kv: req.prev_kv,
                    watch_id: 0,
                },
            )),
        };
        req_tx
            .send(create)
            .await
            .map_err(|_| StorageError::internal("watch request stream closed"))?;

        let codec: ProstCodec<proto::WatchRequest, proto::WatchResponse> = ProstCodec::default();
        let inbound = grpc
            .streaming(
                tonic::Request::new(ReceiverStream::new(req_rx)),
                PathAndQuery::from_static(WATCH),
                codec,
            )
            .await
            .map_err(status_to_error)?
            .into_inner();

        {
            let mut senders = self.watch_requests.lock();
            senders.retain(|s| !s.is_closed());
            senders.push(req_tx.clone());
        }

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let cancel = self.shutdown.child_token();
        trace!(prefix = %req.prefix, start = req.start_revision, "etcd watch opened");
        tokio::spawn(pump_watch(
            inbound,
            req_tx,
            tx,
            cancel.clone(),
            req.start_revision,
        ));
        Ok(BackendWatch::new(rx, cancel))
    }
}

/// Translate watch responses into batches until the stream ends, the
/// consumer goes away, or the watch is cancelled. `req_tx` keeps the request
/// half of the bidi stream open for as long as the watch runs.
async fn pump_watch(
    mut inbound: Streaming<proto::WatchResponse>,
    req_tx: mpsc::Sender<proto::WatchRequest>,
    tx: mpsc::Sender<StorageResult<WatchBatch>>,
    cancel: CancellationToken,
    start_revision: u64,
) {
    let _req_tx = req_tx;
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => return,
            msg = inbound.message() => msg,
        };
        let resp = match msg {
            Ok(Some(resp)) => resp,
            Ok(None) => {
                let _ = tx
                    .send(Err(StorageError::unavailable("watch stream closed by server")))
                    .await;
                return;
            }
            Err(status) => {
                let _ = tx.send(Err(status_to_error(status))).await;
                return;
            }
        };

        if resp.compact_revision != 0 {
            let _ = tx
                .send(Err(StorageError::compacted(
                    start_revision,
                    resp.compact_revision as u64,
                )))
                .await;
            return;
        }
        if resp.canceled {
            let _ = tx
                .send(Err(StorageError::cancelled(format!(
                    "watch canceled by server: {}",
                    resp.cancel_reason
                ))))
                .await;
            return;
        }
        if resp.created && resp.events.is_empty() {
            continue;
        }

        let revision = resp.revision() as u64;
        let events = resp.events.into_iter().filter_map(convert_event).collect();
        if tx.send(Ok(WatchBatch { revision, events })).await.is_err() {
            return;
        }
    }
}

impl KvBackend for EtcdClient {
    fn range(&self, req: RangeRequest) -> BackendFuture<'_, RangeResult> {
        Box::pin(async move {
            let key = req.key.as_bytes().to_vec();
            let range_end = if req.prefix {
                proto::prefix_range_end(&key)
            } else {
                Vec::new()
            };
            let resp: proto::RangeResponse = self
                .unary(
                    RANGE,
                    proto::RangeRequest {
                        key,
                        range_end,
                        revision: req.revision as i64,
                        count_only: req.count_only,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| match e {
                    StorageError::Compacted {
                        compaction_floor, ..
                    } => StorageError::compacted(req.revision, compaction_floor),
                    e => e,
                })?;
            Ok(RangeResult {
                revision: header_revision(&resp.header),
                count: resp.count as u64,
                kvs: resp.kvs.into_iter().map(convert_kv).collect(),
            })
        })
    }

    fn put(&self, req: PutRequest) -> BackendFuture<'_, TxnOutcome> {
        Box::pin(self.put_inner(req))
    }

    fn delete(&self, key: String, guard: Guard) -> BackendFuture<'_, TxnOutcome> {
        Box::pin(self.delete_inner(key, guard))
    }

    fn watch(&self, req: WatchRequest) -> BackendFuture<'_, BackendWatch> {
        Box::pin(self.watch_inner(req))
    }

    fn request_progress(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let senders: Vec<_> = {
                let mut senders = self.watch_requests.lock();
                senders.retain(|s| !s.is_closed());
                senders.clone()
            };
            for sender in senders {
                let progress = proto::WatchRequest {
                    request_union: Some(proto::watch_request::RequestUnion::ProgressRequest(
                        proto::WatchProgressRequest {},
                    )),
                };
                if sender.send(progress).await.is_err() {
                    trace!("progress request on a finished watch");
                }
            }
            Ok(())
        })
    }

    fn readiness(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            let resp: proto::StatusResponse = self.unary(STATUS, proto::StatusRequest {}).await?;
            if !resp.errors.is_empty() {
                return Err(StorageError::unavailable(resp.errors.join("; ")));
            }
            Ok(())
        })
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();
        self.watch_requests.lock().clear();
        debug!("etcd client closed");
    }

    fn name(&self) -> &'static str {
        "etcd"
    }
}

fn header_revision(header: &Option<proto::ResponseHeader>) -> u64 {
    header.as_ref().map_or(0, |h| h.revision.max(0) as u64)
}

fn convert_kv(kv: proto::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(&kv.key).into_owned(),
        value: kv.value,
        create_revision: kv.create_revision.max(0) as u64,
        mod_revision: kv.mod_revision.max(0) as u64,
        version: kv.version.max(0) as u64,
    }
}

fn convert_event(event: proto::Event) -> Option<RawEvent> {
    let kind = match proto::EventType::try_from(event.r#type) {
        Ok(proto::EventType::Put) => RawEventKind::Put,
        Ok(proto::EventType::Delete) => RawEventKind::Delete,
        Err(_) => {
            warn!(event_type = event.r#type, "unknown watch event type");
            return None;
        }
    };
    Some(RawEvent {
        kind,
        kv: convert_kv(event.kv?),
        prev_kv: event.prev_kv.map(convert_kv),
    })
}

/// Map a gRPC status onto the storage error classes.
pub fn status_to_error(status: Status) -> StorageError {
    let message = status.message().to_string();
    match status.code() {
        Code::Cancelled => StorageError::cancelled(message),
        Code::OutOfRange if message.contains("compacted") => StorageError::compacted(0, 0),
        Code::Unavailable
        | Code::DeadlineExceeded
        | Code::Aborted
        | Code::ResourceExhausted
        | Code::Unknown => StorageError::unavailable(message),
        Code::InvalidArgument | Code::FailedPrecondition | Code::OutOfRange => {
            StorageError::invalid(message)
        }
        code => StorageError::internal(format!("{:?}: {}", code, message)),
    }
}
