//! End-to-end tests: a host and a client talking over loopback TCP.
//!
//! Hosts bind port 0 and the tests read the assigned port back from
//! `HostService::host_port`, so suites can run in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use remorun::Args;
use remorun::ClientService;
use remorun::Error;
use remorun::Failure;
use remorun::FromValue;
use remorun::HostConfig;
use remorun::HostPort;
use remorun::HostService;
use remorun::Object;
use remorun::ObjectBuilder;
use remorun::Position;
use remorun::ReentryPolicy;
use remorun::RemoteProxy;
use remorun::Shape;
use remorun::SharedValue;
use remorun::Value;
use remorun::WorkContext;
use tokio::io::AsyncWriteExt;

fn setup() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug)]
enum TestError {
    Failed,
    Custom(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Failed => Ok(()),
            TestError::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for TestError {}

#[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
struct Point {
    x: i64,
    y: i64,
}

async fn sum_of(value: Value) -> Result<i64, Failure> {
    let map = match value {
        Value::Object(object) => object.invoke("get", vec![]).await?,
        plain => plain,
    };
    let map = BTreeMap::<String, i64>::from_value(map)
        .ok_or_else(|| Failure::bad_arguments("expected a map of integers"))?;
    Ok(map.values().sum())
}

fn demo_root() -> Object {
    ObjectBuilder::new("DemoRoot")
        .sync_method("returnString", |_| Ok("Swift String".into()))
        .sync_method("returnArray", |_| Ok(vec![1i64, 2, 3].into()))
        .method("sumFrom:", |args: Args| async move {
            let value = args.get(0).cloned().unwrap_or(Value::Unit);
            Ok(Value::Int(sum_of(value).await?))
        })
        .method("bump:", |args: Args| async move {
            if let Ok(object) = args.arg::<Object>(0) {
                object.invoke("set", vec!["a".into(), 100i64.into()]).await?;
            }
            Ok(Value::Unit)
        })
        .method("returnWithBlock:", |args: Args| async move {
            let block: Object = args.arg(0)?;
            Ok(block.invoke("call", vec!["from host".into()]).await?)
        })
        .method("reenter:", |args: Args| async move {
            let block: Object = args.arg(0)?;
            Ok(block.invoke("call", vec![]).await?)
        })
        .sync_method("throwError", |_| Err(TestError::Failed.into()))
        .sync_method("throwCustom", |_| Err(TestError::Custom("custom message".into()).into()))
        .typed_method("sumPoint:", vec![Shape::coded("Point")], |args: Args| async move {
            let coded: remorun::Coded = args.arg(0)?;
            let point: Point = coded.decode()?;
            Ok(Value::Int(point.x + point.y))
        })
        .sync_method("returnObject", |_| {
            Ok(ObjectBuilder::new("Child")
                .sync_method("name", |_| Ok("child".into()))
                .build()
                .into())
        })
        .method("slow", |_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Unit)
        })
        .sync_method("bigString", |_| Ok("x".repeat(4096).into()))
        .sync_method("opaque", |_| Ok(Value::by_value(opaque())))
        .sync_method("boom", |_| panic!("boom"))
        .build()
}

/// An object with no snapshot, so it can only travel by reference.
fn opaque() -> Object {
    ObjectBuilder::new("Opaque").sync_method("name", |_| Ok("opaque".into())).build()
}

async fn start(config: HostConfig) -> HostService {
    HostService::with_config(HostPort::new(0), demo_root(), config)
        .await
        .expect("host starts")
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

fn dictionary() -> SharedValue {
    let mut m = BTreeMap::new();
    m.insert("a".to_string(), 1i64);
    m.insert("b".to_string(), 2i64);
    SharedValue::new(m)
}

// --- Scenario: returnString ---

#[tokio::test]
async fn test_return_string() -> anyhow::Result<()> {
    setup();
    let host = HostService::start(HostPort::new(0), demo_root(), WorkContext::Serial).await?;
    let client = ClientService::new();

    let root = client.root_object(host.host_port()).await?;
    let value: String = root.invoke_as("returnString", vec![]).await?;
    assert_eq!(value, "Swift String");

    let array: Vec<i64> = root.invoke_as("returnArray", vec![]).await?;
    assert_eq!(array, vec![1, 2, 3]);
    Ok(())
}

// --- Scenario: dictionary by reference and by value ---

#[tokio::test]
async fn test_sum_by_reference_and_by_value() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;
    let dict = dictionary();

    let by_ref: i64 = root.invoke_as("sumFrom:", vec![dict.clone().into()]).await?;
    let by_value: i64 = root.invoke_as("sumFrom:", vec![Value::by_value(dict.clone())]).await?;
    assert_eq!(by_ref, 3);
    assert_eq!(by_value, 3);
    Ok(())
}

#[tokio::test]
async fn test_by_value_copies_are_independent() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;
    let dict = dictionary();
    let original = dict.get();

    root.invoke("bump:", vec![Value::by_value(dict.clone())]).await?;
    assert_eq!(dict.get(), original);

    root.invoke("bump:", vec![dict.clone().into()]).await?;
    let bumped = BTreeMap::<String, i64>::from_value(dict.get()).expect("still a map");
    assert_eq!(bumped["a"], 100);
    assert_eq!(bumped["b"], 2);
    Ok(())
}

// --- Scenario: callbacks ---

#[tokio::test]
async fn test_return_with_block() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let block = Value::callback({
        let calls = calls.clone();
        move |args: Args| {
            let calls = calls.clone();
            async move {
                let from: String = args.arg(0)?;
                calls.lock().unwrap().push(from);
                Ok(Value::Str("from client".into()))
            }
        }
    });

    let result: String = root.invoke_as("returnWithBlock:", vec![block]).await?;
    assert_eq!(result, "from client");
    assert_eq!(*calls.lock().unwrap(), vec!["from host".to_string()]);
    Ok(())
}

// --- Scenario: errors ---

#[tokio::test]
async fn test_thrown_errors() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    match root.invoke("throwError", vec![]).await {
        Err(err @ Error::Remote(_)) => assert!(err.to_string().contains("TestError")),
        other => panic!("expected a remote error, got {:?}", other),
    }

    match root.invoke("throwCustom", vec![]).await {
        Err(Error::Remote(envelope)) => {
            assert_eq!(envelope.description(), "custom message");
            assert!(envelope.domain.ends_with("TestError"));
            assert_eq!(envelope.kind, "Custom");
        }
        other => panic!("expected a remote error, got {:?}", other),
    }

    match root.invoke("teleport", vec![]).await {
        Err(Error::SelectorNotSupported { selector, type_name }) => {
            assert_eq!(selector, "teleport");
            assert_eq!(type_name, "DemoRoot");
        }
        other => panic!("expected SelectorNotSupported, got {:?}", other),
    }
    Ok(())
}

// --- Scenario: invalidate during an in-flight call ---

#[tokio::test]
async fn test_invalidate_during_call() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default().with_work_context(WorkContext::Concurrent)).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;
    assert_eq!(root.invoke_as::<String>("returnString", vec![]).await?, "Swift String");

    let in_flight = tokio::spawn({
        let root = root.clone();
        async move { root.invoke("slow", vec![]).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    host.invalidate();
    host.invalidate();
    assert!(!host.is_valid());

    let outcome = tokio::time::timeout(Duration::from_secs(5), in_flight).await??;
    assert!(matches!(outcome, Err(Error::ConnectionLost(_))), "got {:?}", outcome);

    assert!(eventually(|| !root.is_valid()).await);
    assert!(matches!(root.invoke("returnString", vec![]).await, Err(Error::ConnectionClosed)));
    assert_eq!(host.connection_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_drop_invalidates_host() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    drop(host);
    assert!(eventually(|| !root.is_valid()).await);
    Ok(())
}

// --- Addressing ---

#[tokio::test]
async fn test_unreachable_host() {
    setup();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    drop(listener);

    let client = ClientService::new();
    match client.root_object(&HostPort::new(port)).await {
        Err(Error::HostUnreachable(_)) => {}
        other => panic!("expected HostUnreachable, got {:?}", other),
    }
}

#[tokio::test]
async fn test_port_qualifiers() -> anyhow::Result<()> {
    setup();
    let host = HostService::with_config(
        HostPort::new(0).with_name("demo").with_device_serial("SN-1"),
        demo_root(),
        HostConfig::default(),
    )
    .await?;
    let port = host.host_port().port;
    let client = ClientService::new();

    let wrong = HostPort::new(port).with_name("other");
    assert!(matches!(client.root_object(&wrong).await, Err(Error::HostUnreachable(_))));

    let right = HostPort::new(port).with_name("demo");
    let root = client.root_object(&right).await?;
    assert_eq!(root.invoke_as::<String>("returnString", vec![]).await?, "Swift String");
    Ok(())
}

#[tokio::test]
async fn test_connection_reuse() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();

    let first = client.root_object(host.host_port()).await?;
    let second = client.root_object(host.host_port()).await?;
    assert_eq!(first.connection_id(), second.connection_id());
    assert_eq!(client.connection_count(), 1);
    assert!(eventually(|| host.connection_count() == 1).await);

    client.disconnect(host.host_port());
    assert!(!first.is_valid());
    assert!(eventually(|| host.connection_count() == 0).await);

    let third = client.root_object(host.host_port()).await?;
    assert_ne!(third.connection_id(), first.connection_id());
    Ok(())
}

#[tokio::test]
async fn test_garbage_listener_is_unreachable() -> anyhow::Result<()> {
    setup();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    tokio::spawn(async move {
        if let Ok((mut stream, _)) = listener.accept().await {
            // a well-framed body that is not a handshake frame
            let _ = stream.write_all(&[0, 0, 0, 3, 0xff, 0xff, 0xff]).await;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    });

    let client = ClientService::new();
    match client.root_object(&HostPort::new(port)).await {
        Err(Error::HostUnreachable(_)) => {}
        other => panic!("expected HostUnreachable, got {:?}", other),
    }
    assert_eq!(client.connection_count(), 0);
    Ok(())
}

// --- Values ---

#[tokio::test]
async fn test_coded_argument() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    let point = Value::coded(&Point { x: 5, y: 10 })?;
    assert_eq!(root.invoke_as::<i64>("sumPoint:", vec![point]).await?, 15);

    match root.invoke("sumPoint:", vec![5i64.into()]).await {
        Err(Error::BadArguments(_)) => {}
        other => panic!("expected BadArguments, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_returned_object() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    let child: RemoteProxy = root.invoke_as("returnObject", vec![]).await?;
    assert_ne!(child.id(), root.id());
    assert_eq!(child.invoke_as::<String>("name", vec![]).await?, "child");
    Ok(())
}

#[tokio::test]
async fn test_not_serializable_names_position() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    let args = vec![Value::Unit, Value::by_value(opaque())];
    match root.invoke("bump:", args).await {
        Err(Error::NotSerializable { position: Position::Argument(1), .. }) => {}
        other => panic!("expected NotSerializable at argument 1, got {:?}", other),
    }

    match root.invoke("opaque", vec![]).await {
        Err(Error::NotSerializable { position: Position::ReturnValue, .. }) => {}
        other => panic!("expected NotSerializable at the return value, got {:?}", other),
    }
    Ok(())
}

#[tokio::test]
async fn test_oversized_reply_is_not_serializable() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default().with_max_frame_size(1024)).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    let outcome = tokio::time::timeout(Duration::from_secs(5), root.invoke("bigString", vec![])).await?;
    match outcome {
        Err(Error::NotSerializable { position: Position::ReturnValue, .. }) => {}
        other => panic!("expected NotSerializable at the return value, got {:?}", other),
    }

    // the connection keeps serving
    assert_eq!(root.invoke_as::<String>("returnString", vec![]).await?, "Swift String");
    Ok(())
}

// --- Panicking methods ---

#[tokio::test]
async fn test_panics_become_remote_errors() -> anyhow::Result<()> {
    setup();
    for context in [WorkContext::Serial, WorkContext::Concurrent] {
        let host = start(HostConfig::default().with_work_context(context)).await;
        let client = ClientService::new();
        let root = client.root_object(host.host_port()).await?;

        let outcome = tokio::time::timeout(Duration::from_secs(5), root.invoke("boom", vec![])).await?;
        match outcome {
            Err(Error::Remote(envelope)) => {
                assert_eq!(envelope.domain, "panic");
                assert_eq!(envelope.description(), "boom");
            }
            other => panic!("{:?}: expected a remote error, got {:?}", context, other),
        }

        // later calls, from any client, still run
        let other = ClientService::new();
        let again = other.root_object(host.host_port()).await?;
        let value = tokio::time::timeout(Duration::from_secs(5), again.invoke_as::<String>("returnString", vec![])).await??;
        assert_eq!(value, "Swift String");
        assert_eq!(root.invoke_as::<String>("returnString", vec![]).await?, "Swift String");
    }
    Ok(())
}

// --- Reentrancy ---

async fn reenter(policy: ReentryPolicy) -> anyhow::Result<remorun::Result<Value>> {
    let host = start(HostConfig::default().with_reentry(policy)).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    let block = Value::callback({
        let root = root.clone();
        move |_| {
            let root = root.clone();
            async move { Ok(root.invoke("returnString", vec![]).await?) }
        }
    });
    Ok(tokio::time::timeout(Duration::from_secs(5), root.invoke("reenter:", vec![block])).await?)
}

#[tokio::test]
async fn test_reentry_inline() -> anyhow::Result<()> {
    setup();
    let outcome = reenter(ReentryPolicy::Inline).await?;
    assert_eq!(outcome?, Value::Str("Swift String".into()));
    Ok(())
}

#[tokio::test]
async fn test_reentry_reject() -> anyhow::Result<()> {
    setup();
    let outcome = reenter(ReentryPolicy::Reject).await?;
    assert!(matches!(outcome, Err(Error::ReentrantDeadlock)), "got {:?}", outcome);
    Ok(())
}

// --- Blocking callers ---

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_invoke_blocking() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let client = ClientService::new();
    let root = client.root_object(host.host_port()).await?;

    // on a runtime thread the blocking form refuses instead of stalling
    assert!(matches!(root.invoke_blocking("returnString", vec![]), Err(Error::ReentrantDeadlock)));

    let blocking = root.clone();
    let value = std::thread::spawn(move || blocking.invoke_blocking("returnString", vec![]))
        .join()
        .expect("thread finishes")?;
    assert_eq!(value, Value::Str("Swift String".into()));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_root_object_blocking() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let port = host.host_port().clone();

    let value = std::thread::spawn(move || {
        let client = ClientService::new();
        let root = client.root_object_blocking(&port)?;
        root.invoke_blocking("returnString", vec![])
    })
    .join()
    .expect("thread finishes")?;
    assert_eq!(value, Value::Str("Swift String".into()));
    Ok(())
}

#[tokio::test]
async fn test_default_client() -> anyhow::Result<()> {
    setup();
    let host = start(HostConfig::default()).await;
    let root = remorun::root_object(host.host_port()).await?;
    assert_eq!(root.invoke_as::<String>("returnString", vec![]).await?, "Swift String");
    Ok(())
}
