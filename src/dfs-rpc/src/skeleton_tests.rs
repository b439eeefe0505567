use crate::{
    MethodDesc, RpcError, RpcFault, RpcRequest, RpcService, RpcStub, ServiceDesc, Skeleton,
    SkeletonEvents,
};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const ECHO_DESC: ServiceDesc = ServiceDesc {
    name: "test.echo",
    methods: &[
        MethodDesc {
            name: "echo",
            param_types: &["string"],
            throws_rpc: true,
        },
        MethodDesc {
            name: "fail",
            param_types: &[],
            throws_rpc: true,
        },
    ],
};

const BROKEN_DESC: ServiceDesc = ServiceDesc {
    name: "test.broken",
    methods: &[MethodDesc {
        name: "silent",
        param_types: &[],
        throws_rpc: false,
    }],
};

struct EchoService;

#[async_trait::async_trait]
impl RpcService for EchoService {
    async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
        match req.method.as_str() {
            "echo" => Ok(req.params),
            "fail" => Err(RpcFault::new("invalid_state", "always fails")),
            other => Err(RpcFault::new("rpc", format!("unexpected method {}", other))),
        }
    }
}

async fn start_echo() -> (Arc<Skeleton>, SocketAddr) {
    let skeleton = Arc::new(
        Skeleton::new(
            ECHO_DESC,
            Arc::new(EchoService),
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap(),
    );
    skeleton.start().await.unwrap();
    let addr = skeleton.local_addr().await.unwrap();
    (skeleton, addr)
}

// ==================== Dispatch ====================

#[tokio::test]
async fn test_echo_round_trip() {
    let (skeleton, addr) = start_echo().await;
    let stub = RpcStub::new(ECHO_DESC, addr).unwrap();

    let reply = stub.call("echo", json!(["hello"])).await.unwrap();
    assert_eq!(reply, json!(["hello"]));

    skeleton.stop().await;
}

#[tokio::test]
async fn test_fault_is_reraised() {
    let (skeleton, addr) = start_echo().await;
    let stub = RpcStub::new(ECHO_DESC, addr).unwrap();

    let err = stub.call("fail", json!([])).await.unwrap_err();
    let fault = err.remote_fault().expect("expected a remote fault");
    assert_eq!(fault.kind, "invalid_state");
    assert_eq!(fault.message, "always fails");

    skeleton.stop().await;
}

#[tokio::test]
async fn test_unknown_method_fault() {
    let (skeleton, addr) = start_echo().await;
    // A stub over a wider interface than the server actually serves.
    const WIDER: ServiceDesc = ServiceDesc {
        name: "test.echo",
        methods: &[MethodDesc {
            name: "missing",
            param_types: &[],
            throws_rpc: true,
        }],
    };
    let stub = RpcStub::new(WIDER, addr).unwrap();

    let err = stub.call("missing", json!([])).await.unwrap_err();
    let fault = err.remote_fault().unwrap();
    assert_eq!(fault.kind, "rpc");
    assert!(fault.message.contains("unknown method"));

    skeleton.stop().await;
}

#[tokio::test]
async fn test_signature_mismatch_fault() {
    let (skeleton, addr) = start_echo().await;
    // Same method name, different declared parameter types.
    const SHIFTED: ServiceDesc = ServiceDesc {
        name: "test.echo",
        methods: &[MethodDesc {
            name: "echo",
            param_types: &["string", "u64"],
            throws_rpc: true,
        }],
    };
    let stub = RpcStub::new(SHIFTED, addr).unwrap();

    let err = stub.call("echo", json!(["hello", 3])).await.unwrap_err();
    let fault = err.remote_fault().unwrap();
    assert_eq!(fault.kind, "rpc");
    assert!(fault.message.contains("signature mismatch"));

    skeleton.stop().await;
}

// ==================== Interface contract ====================

#[test]
fn test_broken_interface_rejected_at_construction() {
    let err = Skeleton::new(
        BROKEN_DESC,
        Arc::new(EchoService),
        "127.0.0.1:0".parse().unwrap(),
    )
    .unwrap_err();
    assert!(matches!(err, RpcError::BadInterface(_)));

    let err = RpcStub::new(BROKEN_DESC, "127.0.0.1:9".parse().unwrap()).unwrap_err();
    assert!(matches!(err, RpcError::BadInterface(_)));
}

#[test]
fn test_duplicate_method_rejected() {
    const DUPED: ServiceDesc = ServiceDesc {
        name: "test.duped",
        methods: &[
            MethodDesc {
                name: "a",
                param_types: &[],
                throws_rpc: true,
            },
            MethodDesc {
                name: "a",
                param_types: &["string"],
                throws_rpc: true,
            },
        ],
    };
    assert!(matches!(DUPED.validate(), Err(RpcError::BadInterface(_))));
}

// ==================== Lifecycle ====================

#[tokio::test]
async fn test_double_start_fails() {
    let (skeleton, _addr) = start_echo().await;
    let err = skeleton.start().await.unwrap_err();
    assert!(matches!(err, RpcError::InvalidState(_)));
    skeleton.stop().await;
}

#[tokio::test]
async fn test_restart_after_stop() {
    let (skeleton, addr) = start_echo().await;
    skeleton.stop().await;

    // The old endpoint must be gone.
    let stub = RpcStub::new(ECHO_DESC, addr).unwrap();
    assert!(stub.call("echo", json!(["x"])).await.is_err());

    skeleton.start().await.unwrap();
    let addr2 = skeleton.local_addr().await.unwrap();
    let stub2 = RpcStub::new(ECHO_DESC, addr2).unwrap();
    assert_eq!(stub2.call("echo", json!(["y"])).await.unwrap(), json!(["y"]));
    skeleton.stop().await;
}

#[tokio::test]
async fn test_stopped_hook_fires_once() {
    struct CountingEvents {
        stopped: AtomicUsize,
        causes: Mutex<Vec<bool>>,
    }
    impl SkeletonEvents for CountingEvents {
        fn stopped(&self, cause: Option<&RpcError>) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
            self.causes.lock().unwrap().push(cause.is_some());
        }
    }

    let events = Arc::new(CountingEvents {
        stopped: AtomicUsize::new(0),
        causes: Mutex::new(Vec::new()),
    });
    let skeleton = Skeleton::with_events(
        ECHO_DESC,
        Arc::new(EchoService),
        "127.0.0.1:0".parse().unwrap(),
        events.clone(),
    )
    .unwrap();

    skeleton.start().await.unwrap();
    skeleton.stop().await;
    skeleton.stop().await; // second stop is a no-op

    assert_eq!(events.stopped.load(Ordering::SeqCst), 1);
    assert_eq!(events.causes.lock().unwrap().as_slice(), &[false]);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_worker() {
    struct SlowService;
    #[async_trait::async_trait]
    impl RpcService for SlowService {
        async fn dispatch(&self, req: RpcRequest) -> Result<Value, RpcFault> {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            Ok(req.params)
        }
    }

    let skeleton = Arc::new(
        Skeleton::new(
            ECHO_DESC,
            Arc::new(SlowService),
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap(),
    );
    skeleton.start().await.unwrap();
    let addr = skeleton.local_addr().await.unwrap();

    let stub = RpcStub::new(ECHO_DESC, addr).unwrap();
    let call = tokio::spawn(async move { stub.call("echo", json!(["slow"])).await });

    // Let the connection land before stopping.
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    skeleton.stop().await;

    // The in-flight request completed even though the listener shut down.
    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply, json!(["slow"]));
}

// ==================== Stub identity ====================

#[test]
fn test_stub_identity() {
    let a1 = RpcStub::new(ECHO_DESC, "127.0.0.1:7000".parse().unwrap()).unwrap();
    let a2 = RpcStub::new(ECHO_DESC, "127.0.0.1:7000".parse().unwrap()).unwrap();
    let b = RpcStub::new(ECHO_DESC, "127.0.0.1:7001".parse().unwrap()).unwrap();

    assert_eq!(a1, a2);
    assert_ne!(a1, b);

    let mut set = HashSet::new();
    set.insert(a1.clone());
    set.insert(a2);
    set.insert(b);
    assert_eq!(set.len(), 2);

    assert!(a1.to_string().contains("127.0.0.1:7000"));
    assert!(a1.to_string().contains("test.echo"));
}
