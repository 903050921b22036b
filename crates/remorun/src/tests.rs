use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use remorpc::Fault;
use remorpc::Frame;
use remorpc::Reply;

use crate::*;
use crate::connection::Connection;
use crate::context::Executor;
use crate::dispatch::Dispatcher;
use crate::handshake;

// ============================================================================
//  HELPERS
// ============================================================================

fn test_root() -> Object {
    let counter = SharedValue::new(0i64);
    ObjectBuilder::new("TestRoot")
        .sync_method("echo", |args| Ok(args.get(0).cloned().unwrap_or(Value::Unit)))
        .typed_method("add", vec![Shape::Int, Shape::Int], |args| async move {
            Ok(Value::Int(args.arg::<i64>(0)? + args.arg::<i64>(1)?))
        })
        .sync_method("makeValue", |_| Ok(SharedValue::new(0i64).into()))
        .sync_method("sameValue", move |_| Ok(counter.clone().into()))
        .method("hang", |_| futures::future::pending())
        .method("callBack", |args| async move {
            let callback: Object = args.arg(0)?;
            Ok(callback.invoke(Callback::SELECTOR, vec![Value::Int(20)]).await?)
        })
        .sync_method("opaque", |_| Ok(Value::by_value(opaque())))
        .sync_method("boom", |_| panic!("boom"))
        .build()
}

/// No snapshot, so passing it by value fails.
fn opaque() -> Object {
    ObjectBuilder::new("Opaque").build()
}

struct Link {
    client: Arc<Connection>,
    host: Arc<Connection>,
    host_registry: Arc<Registry>,
}

impl Link {
    fn root(&self) -> RemoteProxy {
        self.client.proxy_for(ObjectId::ROOT)
    }
}

fn link(root: Object, call_timeout: Option<Duration>) -> Link {
    let (a, b) = MemoryTransport::pair();

    let host_registry = Arc::new(Registry::new());
    host_registry.register_root(root.into_invocable()).expect("root registers");
    let client_registry = Arc::new(Registry::new());

    let host_dispatch = Arc::new(Dispatcher::new(
        host_registry.clone(),
        WorkContext::Serial,
        ReentryPolicy::Inline,
        MarshalPolicy::default(),
    ));
    let client_dispatch = Arc::new(Dispatcher::new(
        client_registry.clone(),
        WorkContext::Concurrent,
        ReentryPolicy::Inline,
        MarshalPolicy::default(),
    ));

    let host = Connection::spawn(Arc::new(b), host_dispatch, client_registry.id(), None);
    let client = Connection::spawn(Arc::new(a), client_dispatch, host_registry.id(), call_timeout);
    Link { client, host, host_registry }
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

// ============================================================================
//  REGISTRY
// ============================================================================

#[test]
fn test_registry_identities() {
    let registry = Registry::new();
    let object = test_root().into_invocable();

    let first = registry.register(object.clone()).unwrap();
    let again = registry.register(object.clone()).unwrap();
    assert_eq!(first, again);
    assert_ne!(first, ObjectId::ROOT);
    assert!(registry.resolve(first).is_ok());

    assert!(registry.release(first));
    assert!(matches!(registry.resolve(first), Err(Error::ObjectReleased(id)) if id == first));
    assert!(matches!(registry.resolve(ObjectId(999)), Err(Error::NotFound(_))));

    // a fresh registration never reuses the released identity
    let fresh = registry.register(object).unwrap();
    assert_ne!(fresh, first);
}

#[test]
fn test_registry_export_counts() {
    let registry = Registry::new();
    let conn = ConnectionId(7);
    let other = ConnectionId(8);
    let object = SharedValue::new(1i64).object().into_invocable();

    let id = registry.export(&object, conn).unwrap();
    assert_eq!(registry.export(&object, conn).unwrap(), id);
    assert_eq!(registry.export(&object, other).unwrap(), id);

    registry.release_remote(id, conn, 1);
    assert!(registry.resolve(id).is_ok());
    registry.release_remote(id, conn, 1);
    assert!(registry.resolve(id).is_ok());

    registry.release_connection(other);
    assert!(matches!(registry.resolve(id), Err(Error::ObjectReleased(_))));
    assert!(registry.is_empty());
}

#[test]
fn test_registry_close() {
    let registry = Registry::new();
    let root = registry.register_root(test_root().into_invocable()).unwrap();
    assert_eq!(root, ObjectId::ROOT);

    registry.close();
    registry.close();
    assert!(registry.is_closed());
    assert!(matches!(registry.resolve(ObjectId::ROOT), Err(Error::ObjectReleased(_))));
    assert!(matches!(registry.register(test_root().into_invocable()), Err(Error::ConnectionClosed)));
}

#[test]
fn test_registry_without_root() {
    let registry = Registry::new();
    assert!(matches!(registry.resolve(ObjectId::ROOT), Err(Error::NotFound(_))));

    registry.register_root(test_root().into_invocable()).unwrap();
    assert!(registry.release(ObjectId::ROOT));
    assert!(matches!(registry.resolve(ObjectId::ROOT), Err(Error::ObjectReleased(_))));
}

// ============================================================================
//  CONNECTION
// ============================================================================

#[tokio::test]
async fn test_invoke_over_memory_transport() -> anyhow::Result<()> {
    let link = link(test_root(), None);
    let root = link.root();

    let echoed = root.invoke("echo", vec!["Swift String".into()]).await?;
    assert_eq!(echoed, Value::Str("Swift String".into()));

    let sum: i64 = root.invoke_as("add", vec![2i64.into(), 3i64.into()]).await?;
    assert_eq!(sum, 5);
    Ok(())
}

#[tokio::test]
async fn test_faults_surface_as_errors() {
    let link = link(test_root(), None);
    let root = link.root();

    match root.invoke("fly", vec![]).await {
        Err(Error::SelectorNotSupported { selector, type_name }) => {
            assert_eq!(selector, "fly");
            assert_eq!(type_name, "TestRoot");
        }
        other => panic!("expected SelectorNotSupported, got {:?}", other),
    }

    match root.invoke("add", vec!["two".into(), 3i64.into()]).await {
        Err(Error::BadArguments(msg)) => assert!(msg.contains("argument 0")),
        other => panic!("expected BadArguments, got {:?}", other),
    }

    // the connection keeps serving after faults
    assert!(root.invoke("echo", vec![]).await.is_ok());
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_replies() -> anyhow::Result<()> {
    let link = link(test_root(), None);
    let root = link.root();

    let calls = (0..32i64).map(|i| {
        let root = root.clone();
        async move { root.invoke_as::<i64>("add", vec![i.into(), 1000i64.into()]).await }
    });
    let results = futures::future::join_all(calls).await;
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result?, i as i64 + 1000);
    }
    assert_eq!(link.client.pending_len(), 0);
    Ok(())
}

#[tokio::test]
async fn test_close_fails_pending_calls_once() {
    let link = link(test_root(), None);
    let root = link.root();

    let waiting = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("hang", vec![]).await }
    });
    assert!(eventually(|| link.client.pending_len() == 1).await);

    link.client.close("test over");
    link.client.close("closed twice");

    match waiting.await.expect("task completes") {
        Err(Error::ConnectionLost(reason)) => assert_eq!(reason, "test over"),
        other => panic!("expected ConnectionLost, got {:?}", other),
    }
    assert_eq!(link.client.pending_len(), 0);
    assert!(!root.is_valid());
    assert!(matches!(root.invoke("echo", vec![]).await, Err(Error::ConnectionClosed)));

    // the peer observes the end of stream too
    assert!(eventually(|| link.host.is_closed()).await);
}

#[tokio::test]
async fn test_call_timeout() {
    let link = link(test_root(), Some(Duration::from_millis(50)));
    let root = link.root();

    assert!(matches!(root.invoke("hang", vec![]).await, Err(Error::Timeout)));
    assert_eq!(link.client.pending_len(), 0);
    assert!(root.is_valid());
}

#[tokio::test]
async fn test_malformed_call_gets_fault_reply() -> anyhow::Result<()> {
    let (raw, end) = MemoryTransport::pair();
    let registry = Arc::new(Registry::new());
    registry.register_root(test_root().into_invocable())?;
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        WorkContext::Concurrent,
        ReentryPolicy::Inline,
        MarshalPolicy::default(),
    ));
    let _conn = Connection::spawn(Arc::new(end), dispatcher, 1, None);

    // a Call without its selector
    let mut enc = remopack::Encoder::new();
    enc.variant_begin("Call")?;
    enc.map_begin()?;
    enc.entry("seq", |e| e.u64(9))?;
    enc.entry("target", |e| e.u64(0))?;
    enc.map_end()?;
    enc.variant_end()?;
    raw.send(&enc.into_bytes()?).await?;

    let bytes = raw.recv().await?.expect("a reply frame");
    match Frame::decode(&bytes)? {
        Frame::Reply(Reply { seq: 9, status: Err(Fault::BadArguments(_)) }) => {}
        other => panic!("expected a BadArguments reply, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_not_serializable_positions() {
    let link = link(test_root(), None);
    let root = link.root();

    match root.invoke("echo", vec![Value::Int(1), Value::by_value(opaque())]).await {
        Err(Error::NotSerializable { position, .. }) => assert_eq!(position, Position::Argument(1)),
        other => panic!("expected NotSerializable, got {:?}", other),
    }
    assert_eq!(link.client.pending_len(), 0);

    match root.invoke("opaque", vec![]).await {
        Err(Error::NotSerializable { position, .. }) => assert_eq!(position, Position::ReturnValue),
        other => panic!("expected NotSerializable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_panicking_method_keeps_host_serving() -> anyhow::Result<()> {
    let link = link(test_root(), None);
    let root = link.root();

    match root.invoke("boom", vec![]).await {
        Err(Error::Remote(envelope)) => {
            assert_eq!(envelope.domain, "panic");
            assert_eq!(envelope.description(), "boom");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    // the serial queue is still running
    let echoed = root.invoke("echo", vec!["after".into()]).await?;
    assert_eq!(echoed, Value::Str("after".into()));
    assert!(!link.host.is_closed());
    Ok(())
}

// ============================================================================
//  REFERENCES
// ============================================================================

#[tokio::test]
async fn test_returned_objects_are_released_on_drop() -> anyhow::Result<()> {
    let link = link(test_root(), None);
    let root = link.root();
    assert_eq!(link.host_registry.len(), 1);

    let value: RemoteProxy = root.invoke_as("makeValue", vec![]).await?;
    assert_eq!(link.host_registry.len(), 2);

    value.invoke("set", vec![5i64.into()]).await?;
    assert_eq!(value.invoke_as::<i64>("get", vec![]).await?, 5);

    drop(value);
    assert!(eventually(|| link.host_registry.len() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_same_object_keeps_one_identity() -> anyhow::Result<()> {
    let link = link(test_root(), None);
    let root = link.root();

    let first: Object = root.invoke_as("sameValue", vec![]).await?;
    let second: Object = root.invoke_as("sameValue", vec![]).await?;
    assert_eq!(first, second);
    assert_eq!(link.host_registry.len(), 2);

    // both references are folded into one proxy and released together
    drop(first);
    drop(second);
    assert!(eventually(|| link.host_registry.len() == 1).await);
    Ok(())
}

#[tokio::test]
async fn test_callback_runs_on_sender() -> anyhow::Result<()> {
    let link = link(test_root(), None);
    let root = link.root();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let callback = Value::callback({
        let seen = seen.clone();
        move |args| {
            let seen = seen.clone();
            async move {
                let n: i64 = args.arg(0)?;
                seen.lock().unwrap().push(n);
                Ok(Value::Int(n + 1))
            }
        }
    });

    let result: i64 = root.invoke_as("callBack", vec![callback]).await?;
    assert_eq!(result, 21);
    assert_eq!(*seen.lock().unwrap(), vec![20]);
    Ok(())
}

// ============================================================================
//  WORK CONTEXTS
// ============================================================================

#[tokio::test]
async fn test_serial_context_keeps_order() {
    let executor = Executor::new(WorkContext::Serial, ReentryPolicy::Inline);
    let order = Arc::new(Mutex::new(Vec::new()));

    let runs = (0..5u64).map(|i| {
        let order = order.clone();
        executor.run(Vec::new(), async move {
            tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
            order.lock().unwrap().push(i);
        })
    });
    let results = futures::future::join_all(runs).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_serial_reentry_policies() {
    for policy in [ReentryPolicy::Inline, ReentryPolicy::Reject] {
        let executor = Arc::new(Executor::new(WorkContext::Serial, policy));
        let nested = executor.clone();

        let outcome = executor
            .run(Vec::new(), async move {
                nested.run(context::current_chain(), async { 7 }).await
            })
            .await
            .expect("outer call runs");

        match (policy, outcome) {
            (ReentryPolicy::Inline, Ok(7)) => {}
            (ReentryPolicy::Reject, Err(Error::ReentrantDeadlock)) => {}
            (policy, other) => panic!("{:?}: unexpected {:?}", policy, other),
        }
    }
}

fn explode() -> u8 {
    panic!("worker blew up")
}

#[tokio::test]
async fn test_executor_survives_panics() {
    for context in [WorkContext::Serial, WorkContext::Concurrent] {
        let executor = Executor::new(context, ReentryPolicy::Inline);

        match executor.run(Vec::new(), async { explode() }).await {
            Err(Error::Remote(envelope)) => {
                assert_eq!(envelope.kind, "Panic");
                assert_eq!(envelope.description(), "worker blew up");
            }
            other => panic!("{:?}: expected a remote error, got {:?}", context, other),
        }

        let after = executor.run(Vec::new(), async { 5u8 }).await;
        assert!(matches!(after, Ok(5)), "{:?}: {:?}", context, after);
    }
}

#[tokio::test]
async fn test_chain_is_empty_outside_invocations() {
    assert!(context::current_chain().is_empty());
    let executor = Executor::new(WorkContext::Concurrent, ReentryPolicy::Reject);
    let chain = executor.run(vec![3, 4], async { context::current_chain() }).await.unwrap();
    assert_eq!(chain, vec![3, 4]);
}

// ============================================================================
//  HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_handshake_accepts_matching_qualifiers() {
    let (a, b) = MemoryTransport::pair();
    let served = HostPort::new(1234).with_name("alpha");
    let wanted = HostPort::new(1234).with_name("alpha").with_device_serial("SN1");

    let (client, host) = tokio::join!(
        handshake::client_handshake(&a, &wanted, 11, Duration::from_secs(1)),
        handshake::host_handshake(&b, &served, 22, Duration::from_secs(1)),
    );
    assert_eq!(client.unwrap(), 22);
    let hello = host.unwrap();
    assert_eq!(hello.registry, 11);
    assert_eq!(hello.device.as_deref(), Some("SN1"));
}

#[tokio::test]
async fn test_handshake_rejects_other_name() {
    let (a, b) = MemoryTransport::pair();
    let served = HostPort::new(1234).with_name("alpha");
    let wanted = HostPort::new(1234).with_name("beta");

    let (client, host) = tokio::join!(
        handshake::client_handshake(&a, &wanted, 11, Duration::from_secs(1)),
        handshake::host_handshake(&b, &served, 22, Duration::from_secs(1)),
    );
    assert!(matches!(client, Err(Error::HostUnreachable(_))));
    assert!(matches!(host, Err(Error::HostUnreachable(_))));
}

// ============================================================================
//  FAILURES
// ============================================================================

#[derive(Debug)]
enum ParseError {
    Truncated,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "input was truncated")
    }
}

impl std::error::Error for ParseError {}

#[test]
fn test_failure_from_std_error() {
    let failure = Failure::from(ParseError::Truncated);
    let envelope = failure.envelope().expect("an application error");
    assert!(envelope.domain.ends_with("ParseError"));
    assert_eq!(envelope.kind, "Truncated");
    assert_eq!(envelope.description(), "input was truncated");

    let io = std::io::Error::new(std::io::ErrorKind::Other, ParseError::Truncated);
    let failure = Failure::from(io);
    let envelope = failure.envelope().unwrap();
    assert_eq!(envelope.description(), "input was truncated");
}

#[derive(Debug)]
struct Layer {
    depth: usize,
    inner: Option<Box<Layer>>,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "layer {}", self.depth)
    }
}

impl std::error::Error for Layer {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.as_deref().map(|l| l as &(dyn std::error::Error + 'static))
    }
}

#[test]
fn test_failure_cause_chain_is_capped() {
    let mut error = Layer { depth: 0, inner: None };
    for depth in 1..200 {
        error = Layer { depth, inner: Some(Box::new(error)) };
    }

    let failure = Failure::from(error);
    let envelope = failure.envelope().expect("an application error");
    assert_eq!(envelope.description(), "layer 199");
    assert_eq!(envelope.chain().count(), crate::error::MAX_CAUSES + 1);

    // the fault still fits in a reply frame
    let reply = Frame::Reply(Reply::fault(3, failure.into_fault()));
    assert!(reply.encode().is_ok());
}

#[test]
fn test_failure_keeps_remote_faults() {
    let failure = Failure::from(Error::ObjectReleased(ObjectId(4)));
    assert!(failure.envelope().is_none());
    assert!(matches!(Error::from(failure), Error::ObjectReleased(ObjectId(4))));
}

// ============================================================================
//  VALUES
// ============================================================================

#[tokio::test]
async fn test_shared_value_selectors() -> anyhow::Result<()> {
    let shared = SharedValue::new(std::collections::BTreeMap::<String, i64>::new());
    let object = shared.object();

    object.invoke("set", vec!["a".into(), 1i64.into()]).await?;
    object.invoke("set", vec!["b".into(), 2i64.into()]).await?;
    assert_eq!(object.invoke("len", vec![]).await?, Value::Int(2));
    assert_eq!(object.invoke("get", vec!["b".into()]).await?, Value::Int(2));
    assert_eq!(
        object.invoke("keys", vec![]).await?,
        Value::List(vec!["a".into(), "b".into()])
    );
    assert_eq!(object.invoke("remove", vec!["a".into()]).await?, Value::Int(1));
    assert_eq!(object.invoke("get", vec!["a".into()]).await?, Value::Unit);

    assert_eq!(object, shared.object());
    assert!(matches!(object.invoke("fly", vec![]).await, Err(Error::SelectorNotSupported { .. })));
    Ok(())
}

#[test]
fn test_coded_values() {
    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Point {
        x: i64,
        y: i64,
    }

    let value = Value::coded(&Point { x: 5, y: 10 }).unwrap();
    let Value::Coded(coded) = &value else {
        panic!("expected a coded value");
    };
    assert_eq!(coded.type_name, "Point");
    assert_eq!(coded.decode::<Point>().unwrap(), Point { x: 5, y: 10 });
    assert_eq!(contract_name::<Vec<Point>>(), "Vec");
}
