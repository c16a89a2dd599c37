//! `schemat-cli` — issues a single RPC against a running node over TCP
//! and prints the decoded response.

use clap::Parser;
use schemat_runtime::envelope::{RpcOptions, RpcRequest, RpcResponse};
use schemat_runtime::ids::ObjectId;
use schemat_runtime::mailbox::never_callback;
use schemat_runtime::transport::tcp::TcpSender;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(version = env!("CARGO_PKG_VERSION"), about = "Issue an RPC against a Schemat node")]
struct Args {
    /// Address of the node's peer TCP listener, e.g. `127.0.0.1:7000`.
    #[arg(long)]
    addr: SocketAddr,

    /// Target agent's numeric object id.
    #[arg(long)]
    agent: u64,

    /// Command to invoke.
    #[arg(long)]
    command: String,

    /// JSON-encoded argument array, e.g. `[1,"two",null]`.
    #[arg(long, default_value = "[]")]
    args: String,

    /// Target role; defaults to `$agent`.
    #[arg(long)]
    role: Option<String>,

    /// Request timeout in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let parsed_args: Vec<JsonValue> = match serde_json::from_str(&args.args) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("invalid --args JSON: {e}");
            std::process::exit(2);
        }
    };

    let sender = match TcpSender::connect_with_retry(
        args.addr,
        Duration::from_millis(args.timeout_ms),
        3,
        Duration::from_millis(100),
        never_callback(),
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            eprintln!("could not connect to {}: {e}", args.addr);
            std::process::exit(1);
        }
    };

    let role = match args.role.as_deref().map(schemat_runtime::ids::Role::try_new).transpose() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("invalid --role: {e}");
            std::process::exit(2);
        }
    };

    let request = RpcRequest {
        rpc: (
            ObjectId::new(args.agent),
            args.command.clone(),
            schemat_runtime::envelope::EncodedArgs(parsed_args),
        ),
        opts: RpcOptions {
            role,
            timeout_ms: Some(args.timeout_ms),
            ..Default::default()
        },
    };

    let payload = serde_json::to_value(&request).expect("RpcRequest always serializes");
    let raw = match sender.mailbox().send(payload).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("rpc failed: {e}");
            std::process::exit(1);
        }
    };

    let Some(raw) = raw else {
        println!("(no response value)");
        return;
    };
    let response: RpcResponse = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("could not decode response: {e}");
            std::process::exit(1);
        }
    };

    match response.into_result() {
        Ok((ret, records)) => {
            println!("{}", serde_json::to_string_pretty(&ret).unwrap_or_default());
            if !records.is_empty() {
                eprintln!("{} mutation record(s) accompanied the response", records.len());
            }
        }
        Err(e) => {
            eprintln!("rpc error: {e}");
            std::process::exit(1);
        }
    }
}
