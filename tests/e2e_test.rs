//! Black-box end-to-end scenarios exercising the public crate API the way
//! a caller outside the kernel would: build a node, deploy an agent, make
//! RPC calls.

use schemat_runtime::agent::EchoAgent;
use schemat_runtime::atlas::{Atlas, GlobalAtlas, LocalAtlas};
use schemat_runtime::envelope::{EncodedArgs, RpcOptions, RpcRequest};
use schemat_runtime::ids::{NodeId, ObjectId, Role, WorkerId};
use schemat_runtime::kernel::MasterKernel;
use schemat_runtime::node::NodeAgent;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;

fn single_process_node(node_id: u32) -> Arc<NodeAgent> {
    let local = Arc::new(LocalAtlas::default());
    let global = Arc::new(GlobalAtlas::default());
    let master = Arc::new(MasterKernel::new(NodeId::new(node_id), local, global));
    NodeAgent::new(NodeId::new(node_id), master, Duration::from_secs(1))
}

async fn deploy(node: &Arc<NodeAgent>, object_id: ObjectId) {
    let start = RpcRequest {
        rpc: (object_id, "start_agent".into(), EncodedArgs(vec![JsonValue::from("$agent")])),
        opts: RpcOptions {
            role: Some(Role::master()),
            ..Default::default()
        },
    };
    let response = node.rpc(start).await;
    assert!(response.err.is_none(), "deploy failed: {:?}", response.err);
}

/// Scenario S1: a client issues `rpc(100, "ping", ["hello"])` against a
/// deployed echo agent and gets its argument back.
#[tokio::test]
async fn single_node_echo_roundtrip() {
    let node = single_process_node(1);
    let object_id = ObjectId::new(100);
    node.register_factory(object_id, move || Arc::new(EchoAgent::new(object_id, Duration::from_secs(60))));
    deploy(&node, object_id).await;

    let request = RpcRequest::new(object_id, "ping", vec![JsonValue::from("hello")]);
    let response = node.rpc(request).await;
    let (ret, _) = response.into_result().unwrap();
    assert_eq!(ret, Some(JsonValue::from("hello")));
}

/// Scenario S3 (mailbox leg): a call that outlives the mailbox's timeout
/// rejects with a timeout error, and a later fast call on the same
/// connection still succeeds. The node's direct in-process dispatch path
/// has no mailbox in front of it (that hop only exists once a call
/// crosses a worker/TCP boundary), so this drives the scenario through an
/// [`schemat_runtime::transport::ipc::IpcChannel`] instead, which is
/// exactly where spec §8's timeout budget applies.
#[tokio::test]
async fn slow_call_times_out_then_channel_recovers() {
    use schemat_runtime::agent::{Agent, CallContext};
    use schemat_runtime::kernel::{Kernel, WorkerKernel};
    use schemat_runtime::transport::ipc::IpcChannel;

    let object_id = ObjectId::new(300);
    let atlas = Arc::new(LocalAtlas::default());
    let kernel = Arc::new(WorkerKernel::new(WorkerId::new(1), atlas));
    let agent: Arc<dyn Agent> = Arc::new(EchoAgent::new(object_id, Duration::from_secs(60)));
    kernel.start_agent(agent, Role::agent()).await.unwrap();

    let (client_io, server_io) = tokio::io::duplex(4096);
    let (client_read, client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let kernel_for_server = Arc::clone(&kernel);
    let callback = schemat_runtime::mailbox::callback_fn(move |msg| {
        let kernel = Arc::clone(&kernel_for_server);
        async move {
            let request: RpcRequest = serde_json::from_value(msg)?;
            let role = request.opts.role_or_default();
            let frame = kernel.find(request.agent_id(), &role).into_iter().next().unwrap();
            let ctx = CallContext::new(None, Default::default());
            let ret = frame.exec(request.command(), request.rpc.2.into_vec(), &ctx).await?;
            Ok(Some(serde_json::to_value(ret)?))
        }
    });
    let _server = IpcChannel::new(server_read, server_write, Duration::from_secs(60), callback);
    let client = IpcChannel::new(
        client_read,
        client_write,
        Duration::from_millis(100),
        schemat_runtime::mailbox::never_callback(),
    );

    let slow = RpcRequest::new(object_id, "sleep", vec![JsonValue::from(10_000u64)]);
    let timed_out = client.mailbox().send(serde_json::to_value(&slow).unwrap()).await;
    assert!(timed_out.is_err(), "a 10s sleep must exceed the 100ms mailbox timeout");

    let fast = RpcRequest::new(object_id, "sleep", vec![JsonValue::from(5u64)]);
    let result = client.mailbox().send(serde_json::to_value(&fast).unwrap()).await.unwrap();
    assert_eq!(result, Some(JsonValue::from(5)));
}

/// Scenario S2 (single-process approximation): a worker-scoped agent
/// started via `$worker._start_agent` (the path place-0 uses when it
/// hosts everything) is reachable by a later plain RPC.
#[tokio::test]
async fn worker_scoped_start_then_call() {
    let node = single_process_node(1);
    let object_id = ObjectId::new(400);
    node.register_factory(object_id, move || Arc::new(EchoAgent::new(object_id, Duration::from_secs(60))));

    let start = RpcRequest {
        rpc: (object_id, "_start_agent".into(), EncodedArgs(vec![JsonValue::from("$agent")])),
        opts: RpcOptions {
            role: Some(Role::worker()),
            worker: Some(WorkerId::new(0)),
            ..Default::default()
        },
    };
    let started = node.rpc(start).await;
    assert!(started.err.is_none(), "{:?}", started.err);

    let ping = RpcRequest::new(object_id, "ping", vec![JsonValue::from(7)]);
    let response = node.rpc(ping).await;
    let (ret, _) = response.into_result().unwrap();
    assert_eq!(ret, Some(JsonValue::from(7)));
}
