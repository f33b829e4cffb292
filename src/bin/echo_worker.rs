//! Reference worker speaking the tool-call protocol
//!
//! Reads one request envelope per line and answers on the same transport:
//! stdin/stdout by default, or TCP with `--listen`.

use anyhow::{Context, Result};
use clap::Parser;
use mcpswitch::protocol::{
    Request, RequestId, Response, METHOD_INITIALIZE, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL,
};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "echo-worker")]
#[command(about = "Sample worker exposing echo-style tools", long_about = None)]
struct Args {
    /// Serve over TCP on this address instead of stdio
    #[arg(long)]
    listen: Option<String>,

    /// Read requests but never answer
    #[arg(long)]
    silent: bool,

    /// Ignore SIGTERM and keep running after stdin closes
    #[arg(long)]
    ignore_term: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.ignore_term {
        ignore_termination()?;
    }

    match &args.listen {
        Some(address) => {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind {address}"))?;
            eprintln!("echo-worker listening on {address}");
            loop {
                let (stream, peer) = listener.accept().await?;
                eprintln!("echo-worker accepted {peer}");
                let (reader, writer) = stream.into_split();
                let silent = args.silent;
                tokio::spawn(async move {
                    if let Err(e) = serve(reader, writer, silent).await {
                        eprintln!("echo-worker connection error: {e}");
                    }
                });
            }
        }
        None => {
            serve(tokio::io::stdin(), tokio::io::stdout(), args.silent).await?;
            if args.ignore_term {
                // Stubborn worker: outlive our input until killed
                loop {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                }
            }
        }
    }

    Ok(())
}

#[cfg(unix)]
fn ignore_termination() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    // Installing a handler replaces the default "terminate" disposition
    let mut term = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        while term.recv().await.is_some() {
            eprintln!("echo-worker ignoring SIGTERM");
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn ignore_termination() -> Result<()> {
    Ok(())
}

async fn serve<R, W>(reader: R, mut writer: W, silent: bool) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() || silent {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("echo-worker: unreadable request: {e}");
                continue;
            }
        };

        let reply = match handle(&request).await {
            Reply::Line(line) => line,
            Reply::Respond(response) => response.to_line(),
        };
        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

enum Reply {
    Respond(Response),
    /// Raw text, for exercising the caller's error handling
    Line(String),
}

async fn handle(request: &Request) -> Reply {
    let id = request.id.clone();
    let params = request.params.clone().unwrap_or(Value::Null);

    match request.method.as_str() {
        METHOD_INITIALIZE => Reply::Respond(Response::success(id, capabilities())),
        METHOD_RESOURCES_READ => {
            let uri = params.get("uri").and_then(Value::as_str).unwrap_or_default();
            Reply::Respond(Response::success(
                id,
                json!({ "uri": uri, "contents": format!("Resource {uri} from echo-worker") }),
            ))
        }
        METHOD_TOOLS_CALL => {
            let tool = params.get("name").and_then(Value::as_str).unwrap_or_default();
            let arguments = params
                .get("arguments")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            call_tool(id, tool, &arguments).await
        }
        other => Reply::Respond(Response::failure(id, format!("Method not found: {other}"))),
    }
}

async fn call_tool(id: RequestId, tool: &str, arguments: &Map<String, Value>) -> Reply {
    match tool {
        "echo" => {
            let message = arguments
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Hello, World!");
            Reply::Respond(Response::success(
                id,
                json!({
                    "success": true,
                    "echoed_message": message,
                    "timestamp": chrono::Utc::now().to_rfc3339(),
                    "server": "echo-worker",
                }),
            ))
        }
        "add" => {
            let a = arguments.get("a").and_then(Value::as_f64);
            let b = arguments.get("b").and_then(Value::as_f64);
            match (a, b) {
                (Some(a), Some(b)) => Reply::Respond(Response::success(id, json!({ "sum": a + b }))),
                _ => Reply::Respond(Response::failure(id, "add needs numeric 'a' and 'b'")),
            }
        }
        "sleep" => {
            let ms = arguments.get("ms").and_then(Value::as_u64).unwrap_or(1000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Reply::Respond(Response::success(id, json!({ "slept_ms": ms })))
        }
        "crash" => std::process::exit(3),
        "garbage" => Reply::Line("this is not an envelope".to_string()),
        "wrong_id" => Reply::Respond(Response::success(
            RequestId::from("not-the-request-id"),
            json!({}),
        )),
        other => Reply::Respond(Response::failure(id, format!("Unknown tool: {other}"))),
    }
}

fn capabilities() -> Value {
    json!({
        "tools": [
            { "name": "echo", "description": "Echo back a message with timestamp" },
            { "name": "add", "description": "Add two numbers" },
            { "name": "sleep", "description": "Wait for a number of milliseconds" },
            { "name": "crash", "description": "Exit without answering" },
            { "name": "garbage", "description": "Answer with a non-JSON line" },
            { "name": "wrong_id", "description": "Answer with an unknown id" }
        ],
        "resources": [
            { "uri": "echo://status", "name": "Worker status" }
        ],
        "prompts": []
    })
}
