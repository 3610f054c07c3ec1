//! End-to-end client-server benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rpcwire_client::{Client, ConnectionConfig};
use rpcwire_server::{Registry, Server, ServerConfig};
use std::sync::Arc;
use tokio::runtime::Runtime;

struct TestSetup {
    _server_handle: tokio::task::JoinHandle<()>,
    client: Client,
}

fn bench_registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register("Echo.Say", |s: String| async move { Ok::<_, String>(s) })
        .unwrap();
    registry
        .register("Arith.Add", |(a, b): (i64, i64)| async move {
            Ok::<_, String>(a + b)
        })
        .unwrap();
    registry
}

fn setup_server_and_client(rt: &Runtime) -> TestSetup {
    let (listener, addr) = rt.block_on(async {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    });

    let server = Arc::new(Server::new(ServerConfig::new(addr), bench_registry()));
    let server_handle = rt.spawn(async move {
        let _ = server.run_with_listener(listener).await;
    });

    let client = rt.block_on(async { Client::connect(ConnectionConfig::new(addr)).await.unwrap() });

    TestSetup {
        _server_handle: server_handle,
        client,
    }
}

fn bench_call_latency(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_call");
    group.throughput(Throughput::Elements(1));

    group.bench_function("add", |b| {
        b.to_async(&rt).iter(|| async {
            let sum: i64 = setup.client.call("Arith.Add", &(1i64, 2i64)).await.unwrap();
            black_box(sum)
        });
    });

    group.finish();
}

fn bench_echo_sizes(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_echo");

    for size in [100, 10_000, 1_000_000] {
        let payload = "x".repeat(size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            b.to_async(&rt).iter(|| async {
                let reply: String = setup.client.call("Echo.Say", payload.as_str()).await.unwrap();
                black_box(reply)
            });
        });
    }

    group.finish();
}

fn bench_pipelined_calls(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let setup = setup_server_and_client(&rt);

    let mut group = c.benchmark_group("e2e_pipelined");

    for concurrency in [1, 10, 100] {
        group.throughput(Throughput::Elements(concurrency as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(concurrency),
            &concurrency,
            |b, &concurrency| {
                b.to_async(&rt).iter(|| async {
                    let calls = (0..concurrency).map(|i| {
                        let client = setup.client.clone();
                        async move {
                            let sum: i64 = client.call("Arith.Add", &(i as i64, 1i64)).await.unwrap();
                            sum
                        }
                    });
                    black_box(futures::future::join_all(calls).await)
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_call_latency,
    bench_echo_sizes,
    bench_pipelined_calls,
);

criterion_main!(benches);
