use criterion::{black_box, criterion_group, criterion_main, Criterion};

use bazi_stream::session::StreamSession;
use bazi_stream::stream::{ChunkPipeline, DeltaBatch, RawChunk};

fn sample_body() -> Vec<u8> {
    let mut body = Vec::new();
    for idx in 0..200 {
        body.extend_from_slice(
            format!(
                "data: {{\"choices\":[{{\"delta\":{{\"reasoning_content\":\"推理第{idx}步，\\n\"}},\"finish_reason\":null}}]}}\n\n"
            )
            .as_bytes(),
        );
    }
    for idx in 0..400 {
        body.extend_from_slice(
            format!(
                "data: {{\"choices\":[{{\"delta\":{{\"content\":\"五行喜忌分析 {idx}\"}},\"finish_reason\":null}}]}}\n\n"
            )
            .as_bytes(),
        );
    }
    body.extend_from_slice(b"data: [DONE]\n\n");
    body
}

fn chunked(body: &[u8], size: usize) -> Vec<RawChunk> {
    body.chunks(size)
        .map(|chunk| RawChunk::from(chunk.to_vec()))
        .collect()
}

fn bench_pipeline(c: &mut Criterion) {
    let body = sample_body();
    for size in [7usize, 64, 1024] {
        let chunks = chunked(&body, size);
        c.bench_function(&format!("pipeline_chunk_{size}"), |b| {
            b.iter(|| {
                let mut pipeline = ChunkPipeline::new();
                let mut batch = DeltaBatch::new();
                for chunk in &chunks {
                    batch.clear();
                    pipeline.process(black_box(chunk), &mut batch);
                }
                pipeline.finish(&mut batch);
                black_box(batch.is_terminal())
            });
        });
    }
}

fn bench_session(c: &mut Criterion) {
    let chunks = chunked(&sample_body(), 256);
    c.bench_function("session_full_stream", |b| {
        b.iter(|| {
            let mut session = StreamSession::new();
            let _ = session.begin_request();
            let mut last = None;
            for chunk in &chunks {
                last = session.on_chunk(black_box(chunk)).or(last);
            }
            black_box(last)
        });
    });
}

criterion_group!(benches, bench_pipeline, bench_session);
criterion_main!(benches);
