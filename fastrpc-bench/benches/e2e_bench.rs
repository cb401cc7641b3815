//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fastrpc_client::{Client, ClientConfig};
use fastrpc_protocol::RpcEncoder;
use fastrpc_server::{Server, ServerConfig};
use serde_json::{json, Value};
use tokio::runtime::Runtime;

struct TestSetup {
    _server: Server,
    client: Client,
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    rt.block_on(async {
        let server = Server::new(ServerConfig::new("127.0.0.1:0".parse().unwrap()));
        server
            .rpc("echo", |args: Vec<Value>, rpc: RpcEncoder| {
                let _ = rpc.send_end(args);
            })
            .unwrap();
        server
            .rpc("stream", |args: Vec<Value>, rpc: RpcEncoder| {
                let count = args.first().and_then(Value::as_u64).unwrap_or(0);
                for i in 0..count {
                    let _ = rpc.send_data(vec![json!(i)]);
                }
                let _ = rpc.send_end(vec![]);
            })
            .unwrap();

        let addr = server.listen().await.unwrap();

        let client = Client::new(ClientConfig::from_addr(addr).with_reconnect(false));
        client.connect().await.unwrap();

        TestSetup {
            _server: server,
            client,
        }
    })
}

fn bench_echo_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_echo");
    group.throughput(Throughput::Elements(1));

    group.bench_function("echo", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                setup
                    .client
                    .rpc("echo", vec![json!("ping")])
                    .collect()
                    .await
                    .unwrap(),
            )
        });
    });

    group.finish();
}

fn bench_streaming(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let client = &setup.client;
    let mut group = c.benchmark_group("e2e_stream");

    for count in [10u64, 100, 1000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async move {
                black_box(
                    client
                        .rpc("stream", vec![json!(count)])
                        .collect()
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_concurrent_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let client = &setup.client;
    let mut group = c.benchmark_group("e2e_concurrent");

    for calls in [10usize, 100] {
        group.throughput(Throughput::Elements(calls as u64));
        group.bench_with_input(BenchmarkId::from_parameter(calls), &calls, |b, &calls| {
            b.to_async(&rt).iter(|| async move {
                let pending: Vec<_> = (0..calls)
                    .map(|i| client.rpc("echo", vec![json!(i)]))
                    .collect();
                for call in pending {
                    black_box(call.collect().await.unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_echo_latency,
    bench_streaming,
    bench_concurrent_calls,
);

criterion_main!(benches);
