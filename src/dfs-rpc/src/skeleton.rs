use crate::{write_message, RpcError, RpcFault, RpcRequest, RpcResponse, RpcResult};
use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// One method of a remote interface. `throws_rpc` records that the method's
/// contract admits a transport failure; every method of a servable interface
/// must set it.
#[derive(Debug, Clone, Copy)]
pub struct MethodDesc {
    pub name: &'static str,
    pub param_types: &'static [&'static str],
    pub throws_rpc: bool,
}

/// Description of a remote interface: the unit shared between a skeleton and
/// the stubs that call it.
#[derive(Debug, Clone, Copy)]
pub struct ServiceDesc {
    pub name: &'static str,
    pub methods: &'static [MethodDesc],
}

impl ServiceDesc {
    /// Checks that the interface can be served remotely. The check runs at
    /// skeleton/stub construction so a bad interface fails before any
    /// traffic flows.
    pub fn validate(&self) -> Result<(), RpcError> {
        if self.name.is_empty() {
            return Err(RpcError::BadInterface("empty interface name".to_string()));
        }
        if self.methods.is_empty() {
            return Err(RpcError::BadInterface(format!(
                "interface {} has no methods",
                self.name
            )));
        }
        for (i, method) in self.methods.iter().enumerate() {
            if method.name.is_empty() {
                return Err(RpcError::BadInterface(format!(
                    "interface {} has an unnamed method",
                    self.name
                )));
            }
            if !method.throws_rpc {
                return Err(RpcError::BadInterface(format!(
                    "method {}.{} does not admit rpc failure",
                    self.name, method.name
                )));
            }
            if self.methods[..i].iter().any(|m| m.name == method.name) {
                return Err(RpcError::BadInterface(format!(
                    "duplicate method {}.{}",
                    self.name, method.name
                )));
            }
        }
        Ok(())
    }

    pub fn method(&self, name: &str) -> Option<&'static MethodDesc> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Server-side implementation of an interface. The dispatcher receives the
/// raw request and returns either the serialized result value or a fault to
/// send back.
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault>;
}

/// Observation hooks for skeleton lifecycle events. All have defaults; a
/// server embedding a skeleton overrides what it needs.
pub trait SkeletonEvents: Send + Sync {
    /// Top-level accept error. Return true to resume accepting, false to
    /// shut the listener down (the error is then reported to `stopped`).
    fn listen_error(&self, _err: &RpcError) -> bool {
        false
    }

    /// Per-connection transport error. Observational only.
    fn service_error(&self, _err: &RpcError) {}

    /// Called exactly once per start/stop cycle, after the listener has
    /// closed and all in-flight workers have drained.
    fn stopped(&self, _cause: Option<&RpcError>) {}
}

struct DefaultEvents;

impl SkeletonEvents for DefaultEvents {}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    handle: JoinHandle<Option<RpcError>>,
}

/// A multithreaded TCP server for one remote interface. Accepts connections
/// on a configured address and serves one framed request per connection,
/// dispatching to the wrapped service implementation.
pub struct Skeleton {
    desc: ServiceDesc,
    service: Arc<dyn RpcService>,
    events: Arc<dyn SkeletonEvents>,
    bind_addr: SocketAddr,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl std::fmt::Debug for Skeleton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Skeleton")
            .field("desc", &self.desc)
            .field("bind_addr", &self.bind_addr)
            .finish()
    }
}

impl Skeleton {
    pub fn new(
        desc: ServiceDesc,
        service: Arc<dyn RpcService>,
        bind_addr: SocketAddr,
    ) -> Result<Self, RpcError> {
        Self::with_events(desc, service, bind_addr, Arc::new(DefaultEvents))
    }

    pub fn with_events(
        desc: ServiceDesc,
        service: Arc<dyn RpcService>,
        bind_addr: SocketAddr,
        events: Arc<dyn SkeletonEvents>,
    ) -> Result<Self, RpcError> {
        desc.validate()?;
        Ok(Self {
            desc,
            service,
            events,
            bind_addr,
            running: tokio::sync::Mutex::new(None),
        })
    }

    pub fn desc(&self) -> &ServiceDesc {
        &self.desc
    }

    /// Address the listener is actually bound to. Useful when the skeleton
    /// was configured with port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Binds the listening socket and spawns the accept loop. Fails if the
    /// skeleton is already started and has not since been stopped.
    pub async fn start(&self) -> Result<(), RpcError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(RpcError::InvalidState(format!(
                "skeleton {} already started",
                self.desc.name
            )));
        }

        let listener = TcpListener::bind(self.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        info!("skeleton {} listening on {}", self.desc.name, local_addr);

        let handle = tokio::spawn(accept_loop(
            listener,
            self.desc,
            self.service.clone(),
            self.events.clone(),
            cancel.clone(),
        ));

        *running = Some(Running {
            local_addr,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Stops accepting, waits for in-flight workers, closes the socket and
    /// fires the `stopped` hook. No-op when not started.
    pub async fn stop(&self) {
        let running = {
            let mut guard = self.running.lock().await;
            guard.take()
        };
        let Some(running) = running else {
            return;
        };

        running.cancel.cancel();
        let cause = match running.handle.await {
            Ok(cause) => cause,
            Err(e) => Some(RpcError::IoError(format!("accept loop panicked: {}", e))),
        };
        info!("skeleton {} stopped", self.desc.name);
        self.events.stopped(cause.as_ref());
    }
}

async fn accept_loop(
    listener: TcpListener,
    desc: ServiceDesc,
    service: Arc<dyn RpcService>,
    events: Arc<dyn SkeletonEvents>,
    cancel: CancellationToken,
) -> Option<RpcError> {
    let mut workers = JoinSet::new();
    let mut cause = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("skeleton {}: connection from {}", desc.name, peer);
                    let service = service.clone();
                    let events = events.clone();
                    workers.spawn(async move {
                        if let Err(e) = serve_connection(stream, desc, service).await {
                            events.service_error(&e);
                        }
                    });
                    // Reap finished workers without blocking the accept path.
                    while workers.try_join_next().is_some() {}
                }
                Err(e) => {
                    let err = RpcError::from(e);
                    warn!("skeleton {}: accept failed: {}", desc.name, err);
                    if !events.listen_error(&err) {
                        cause = Some(err);
                        break;
                    }
                }
            },
        }
    }

    drop(listener);
    while workers.join_next().await.is_some() {}
    cause
}

async fn serve_connection(
    mut stream: TcpStream,
    desc: ServiceDesc,
    service: Arc<dyn RpcService>,
) -> Result<(), RpcError> {
    let body = crate::read_frame(&mut stream).await?;

    let response = match serde_json::from_slice::<RpcRequest>(&body) {
        Err(e) => RpcResponse {
            result: RpcResult::Fault(RpcFault::new(
                "rpc",
                format!("malformed request: {}", e),
            )),
            seq: 0,
        },
        Ok(req) => {
            let seq = req.seq;
            let result = dispatch_request(desc, service, req).await;
            RpcResponse { result, seq }
        }
    };

    write_message(&mut stream, &response).await
}

async fn dispatch_request(
    desc: ServiceDesc,
    service: Arc<dyn RpcService>,
    req: RpcRequest,
) -> RpcResult {
    let Some(method) = desc.method(&req.method) else {
        return RpcResult::Fault(RpcFault::new(
            "rpc",
            format!("unknown method {}.{}", desc.name, req.method),
        ));
    };

    let declared: Vec<&str> = method.param_types.to_vec();
    let offered: Vec<&str> = req.param_types.iter().map(|t| t.as_str()).collect();
    if declared != offered {
        return RpcResult::Fault(RpcFault::new(
            "rpc",
            format!(
                "signature mismatch for {}.{}: declared {:?}, got {:?}",
                desc.name, req.method, declared, offered
            ),
        ));
    }

    match service.dispatch(req).await {
        Ok(value) => RpcResult::Ok(value),
        Err(fault) => RpcResult::Fault(fault),
    }
}
