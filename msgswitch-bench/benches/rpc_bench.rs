//! End-to-end RPC benchmarks over the in-process loopback broker.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use msgswitch_client::{Client, ClientConfig, LoopbackBroker};
use msgswitch_server::{EchoHandler, Server, ServerConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

const QUEUE: &str = "bench.echo";

struct TestSetup {
    _server_handle: tokio::task::JoinHandle<()>,
    client: Arc<Client<LoopbackBroker>>,
}

fn setup_server_and_client(rt: &Runtime, parallel: bool) -> TestSetup {
    let broker = LoopbackBroker::new();
    let transport = Arc::new(broker);

    let server = Arc::new(Server::new(
        transport.clone(),
        ServerConfig::new("loopback").with_token("bench-server"),
    ));
    let server_handle = rt.spawn(async move {
        let _ = if parallel {
            server.listen_p(EchoHandler, QUEUE).await
        } else {
            server.listen(EchoHandler, QUEUE).await
        };
    });

    let client = rt.block_on(async {
        Client::connect(transport, ClientConfig::new("loopback").with_token("bench"))
            .await
            .unwrap()
    });

    TestSetup {
        _server_handle: server_handle,
        client: Arc::new(client),
    }
}

fn bench_rpc_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt, false);

    let mut group = c.benchmark_group("rpc_latency");
    group.throughput(Throughput::Elements(1));

    for size in [16, 1024, 64 * 1024] {
        let payload = "x".repeat(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    setup
                        .client
                        .rpc(QUEUE, payload.clone(), Some(Duration::from_secs(10)))
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_rpc_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt, true);

    let mut group = c.benchmark_group("rpc_concurrent");

    for callers in [4, 16] {
        group.throughput(Throughput::Elements(callers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(callers), &callers, |b, &callers| {
            b.to_async(&rt).iter(|| async {
                let calls: Vec<_> = (0..callers)
                    .map(|i| {
                        let client = setup.client.clone();
                        tokio::spawn(async move {
                            client
                                .rpc(QUEUE, format!("call-{i}"), Some(Duration::from_secs(10)))
                                .await
                                .unwrap()
                        })
                    })
                    .collect();
                for call in calls {
                    black_box(call.await.unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_rpc_latency, bench_rpc_concurrent);
criterion_main!(benches);
