//! remohost - serves a small demo root object so clients have something to
//! talk to.
//!
//! ```text
//! remohost --port 1234 --name demo
//! ```

use std::collections::BTreeMap;
use std::net::IpAddr;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::filter::LevelFilter;

use remorun::Args as CallArgs;
use remorun::Failure;
use remorun::FromValue;
use remorun::HostConfig;
use remorun::HostPort;
use remorun::HostService;
use remorun::Object;
use remorun::ObjectBuilder;
use remorun::ReentryPolicy;
use remorun::SharedValue;
use remorun::Value;
use remorun::WorkContext;

#[derive(Parser, Debug)]
#[command(name = "remohost")]
#[command(about = "Serves a demo root object over remorun")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "1234")]
    port: u16,

    /// Address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: IpAddr,

    /// Service name clients must ask for
    #[arg(long)]
    name: Option<String>,

    /// Device serial clients must ask for
    #[arg(long)]
    device: Option<String>,

    /// Run each call on its own task instead of one queue
    #[arg(long)]
    concurrent: bool,

    /// Refuse reentrant calls instead of running them inline
    #[arg(long)]
    reject_reentry: bool,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

fn demo_root() -> Object {
    let counter = SharedValue::new(0i64);

    ObjectBuilder::new("DemoRoot")
        .sync_method("returnString", |_| Ok("Swift String".into()))
        .sync_method("echo:", |args: CallArgs| Ok(args.get(0).cloned().unwrap_or(Value::Unit)))
        .method("sumFrom:", |args: CallArgs| async move {
            let value = match args.arg::<Object>(0) {
                Ok(object) => object.invoke("get", vec![]).await?,
                Err(_) => args.arg(0)?,
            };
            let map = BTreeMap::<String, i64>::from_value(value)
                .ok_or_else(|| Failure::bad_arguments("expected a map of integers"))?;
            Ok(Value::Int(map.values().sum()))
        })
        .method("returnWithBlock:", |args: CallArgs| async move {
            let block: Object = args.arg(0)?;
            Ok(block.invoke("call", vec!["Swift String".into()]).await?)
        })
        .sync_method("counter", move |_| Ok(counter.clone().into()))
        .build()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(log_level.into())
        .from_env_lossy();
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut port = HostPort::new(args.port);
    if let Some(name) = args.name {
        port = port.with_name(name);
    }
    if let Some(device) = args.device {
        port = port.with_device_serial(device);
    }

    let config = HostConfig::default()
        .with_bind_addr(args.host)
        .with_work_context(if args.concurrent { WorkContext::Concurrent } else { WorkContext::Serial })
        .with_reentry(if args.reject_reentry { ReentryPolicy::Reject } else { ReentryPolicy::Inline });

    let host = HostService::with_config(port, demo_root(), config).await?;
    info!("Serving demo root at {}", host.host_port());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    host.invalidate();

    Ok(())
}
