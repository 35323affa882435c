use std::sync::Arc;

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ril_engine::{
    CallVariant, CapabilityVersion, CompletionSink, DispatchTable, Engine, IncomingResponse,
    OpCode, OperationSpec, RadioTransport, RemoteCode, ResponseKind, SubmitOptions,
    TransportCall, TransportConnector, TransportFault, TransportLink,
};

const OP: OpCode = OpCode(20);

/// Transport that accepts every call and never answers.
struct SinkTransport;

impl RadioTransport for SinkTransport {
    fn capability(&self) -> CapabilityVersion {
        CapabilityVersion::new(1, 6)
    }

    fn invoke(&self, _call: &TransportCall<'_>) -> Result<(), TransportFault> {
        Ok(())
    }

    fn acknowledge(&self) -> Result<(), TransportFault> {
        Ok(())
    }
}

struct SinkConnector;

impl TransportConnector for SinkConnector {
    fn connect(&self, _link: TransportLink) -> anyhow::Result<Arc<dyn RadioTransport>> {
        Ok(Arc::new(SinkTransport))
    }
}

fn engine() -> Engine {
    let table = DispatchTable::new().with(
        OperationSpec::new(OP, "voice_registration_state")
            .variant(CapabilityVersion::new(1, 4), CallVariant::passthrough())
            .variant(CapabilityVersion::new(1, 5), CallVariant::passthrough())
            .variant(CapabilityVersion::new(1, 6), CallVariant::passthrough()),
    );
    Engine::builder(table, Arc::new(SinkConnector))
        .name("bench")
        .start()
        .expect("engine starts")
}

/// Submit → Plain response → sink, all on the calling thread.
fn bench_round_trip(c: &mut Criterion) {
    let engine = engine();
    let payload = Bytes::from(vec![0xABu8; 64]);

    let mut group = c.benchmark_group("engine");
    group.throughput(Throughput::Elements(1));

    group.bench_function("submit_plain_response", |b| {
        b.iter(|| {
            let serial = engine
                .submit(OP, payload.clone(), CompletionSink::discard(), SubmitOptions::new())
                .expect("connected");
            engine.on_incoming(IncomingResponse {
                serial,
                kind: ResponseKind::Plain,
                code: RemoteCode::NONE,
                payload: black_box(payload.clone()),
            });
        });
    });

    group.bench_function("submit_ack_then_response", |b| {
        b.iter(|| {
            let serial = engine
                .submit(OP, payload.clone(), CompletionSink::discard(), SubmitOptions::new())
                .expect("connected");
            for kind in [ResponseKind::AckOnly, ResponseKind::PlainWithAckRequested] {
                engine.on_incoming(IncomingResponse {
                    serial,
                    kind,
                    code: RemoteCode::NONE,
                    payload: Bytes::new(),
                });
            }
        });
    });

    group.finish();
}

/// Effective-version resolution across a deep variant ladder.
fn bench_resolve(c: &mut Criterion) {
    let mut spec = OperationSpec::new(OP, "ladder");
    for minor in 0..16 {
        spec = spec.variant(CapabilityVersion::new(1, minor), CallVariant::passthrough());
    }
    let target = CapabilityVersion::new(1, 9);

    c.bench_function("resolve_variant", |b| {
        b.iter(|| black_box(spec.resolve(black_box(target)).map(|(v, _)| v)));
    });
}

criterion_group!(benches, bench_round_trip, bench_resolve);
criterion_main!(benches);
