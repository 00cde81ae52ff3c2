// Demo function: appends "!" to the `text` field of each request.
//
// Runs a dispatcher on the in-memory broker, sends one correlated request and
// prints the reply, then shuts down.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use fstream_core::{handler_fn, FunctionContext, HandlerRegistry, JsonObject};
use fstream_runtime::broker::{BrokerClient, REQUEST_ID_PROPERTY, RESPONSE_TOPIC_PROPERTY};
use fstream_runtime::config::{EndpointSpec, CONFIG_PATH_ENV};
use fstream_runtime::{init_tracing, BrokerError, Dispatcher, FunctionConfig, LogFormat, MemoryBroker};
use serde_json::{json, Value};
use tracing::{debug, info};

#[derive(Parser, Debug)]
#[command(name = "string-function")]
#[command(about = "Request/reply demo: {\"text\": t} -> {\"result\": t + \"!\"}")]
struct Args {
    /// Function configuration file; built-in defaults when omitted
    #[arg(long, env = CONFIG_PATH_ENV)]
    config: Option<PathBuf>,

    /// Text to send
    #[arg(long, default_value = "Hello")]
    text: String,

    /// Topic the reply is requested on
    #[arg(long, default_value = "string-function-replies")]
    reply_topic: String,

    /// Seconds to wait for the reply
    #[arg(long, default_value = "5")]
    timeout_secs: u64,

    /// Log output format (pretty or json)
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,
}

fn string_process(ctx: &FunctionContext, data: JsonObject) -> Result<Option<JsonObject>> {
    let text = data.get("text").and_then(Value::as_str).unwrap_or_default();
    debug!(config = ?ctx.get_config("test"), "processing");

    let mut out = JsonObject::new();
    out.insert("result".to_string(), json!(format!("{text}!")));
    Ok(Some(out))
}

fn default_config() -> FunctionConfig {
    let mut config = FunctionConfig::default();
    config.name = Some("string-function".to_string());
    config.module = "string".to_string();
    config.sources = vec![EndpointSpec::topic("string-topic")];
    config.metric.port = 0;
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = match &args.config {
        Some(path) => FunctionConfig::from_yaml(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => default_config(),
    };

    let broker = MemoryBroker::new();
    let handlers = HandlerRegistry::new().with("string", handler_fn(string_process));
    let dispatcher = Dispatcher::connect(config, &handlers, Arc::new(broker.clone())).await?;
    let request_topic = dispatcher
        .topics()
        .first()
        .cloned()
        .context("no request topic configured")?;

    let runner = {
        let dispatcher = Arc::clone(&dispatcher);
        tokio::spawn(async move {
            dispatcher
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await
        })
    };

    let replies = broker
        .subscribe(std::slice::from_ref(&args.reply_topic), "string-function-client")
        .await?;

    let request_id = uuid::Uuid::new_v4().to_string();
    broker.publish_json(
        &request_topic,
        &json!({ "text": args.text }),
        &[
            (REQUEST_ID_PROPERTY, request_id.as_str()),
            (RESPONSE_TOPIC_PROPERTY, args.reply_topic.as_str()),
        ],
    )?;
    info!(%request_id, topic = %request_topic, "request sent");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.timeout_secs);
    let reply = loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break None;
        }
        match replies.receive(remaining).await {
            Ok(message) if message.request_id() == Some(request_id.as_str()) => {
                replies.acknowledge(&message).await?;
                break Some(serde_json::from_slice::<Value>(&message.payload)?);
            }
            Ok(message) => debug!(message_id = %message.message_id, "ignoring unrelated reply"),
            Err(BrokerError::Timeout) => break None,
            Err(e) => return Err(e.into()),
        }
    };

    dispatcher.shutdown();
    runner.await??;
    let _ = replies.close().await;

    match reply {
        Some(body) => {
            println!("{body}");
            Ok(())
        }
        None => bail!("no reply within {}s", args.timeout_secs),
    }
}
