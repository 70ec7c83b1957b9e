//! Benchmarks for run state handling on the hot path of every step task.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engageflow::coordinator::PipelineSummary;
use engageflow::core::{RunStatus, StepStatus};
use engageflow::retry::{BackoffStrategy, RetryConfig};
use engageflow::state::{PipelineMetadata, PipelineRun};

fn sample_run(run_id: &str, steps: usize) -> PipelineRun {
    let mut run = PipelineRun::new(run_id, "post-1");
    for i in 0..steps {
        run = if i % 3 == 0 {
            run.with_optional_step(format!("step-{i}"))
        } else {
            run.with_required_step(format!("step-{i}"))
        };
    }
    for (i, state) in run.steps.values_mut().enumerate() {
        state.status = if i % 7 == 0 {
            StepStatus::Failed
        } else {
            StepStatus::Succeeded
        };
        state.result = Some(serde_json::json!({"count": i, "label": "ok"}));
    }
    run
}

fn summary_benchmark(c: &mut Criterion) {
    let run = sample_run("run-1", 32);
    c.bench_function("summary_rollup_32_steps", |b| {
        b.iter(|| PipelineSummary::from_run(black_box(&run)));
    });
}

fn metadata_benchmark(c: &mut Criterion) {
    let mut metadata = PipelineMetadata::default();
    for i in 0..5 {
        let mut run = sample_run(&format!("run-{i}"), 6);
        run.status = RunStatus::Completed;
        metadata.runs.insert(run.run_id.clone(), run);
    }
    metadata.latest_run_id = Some("run-4".into());
    let mut blob = serde_json::json!({"caption_lang": "en"});
    if metadata.write_into(&mut blob).is_err() {
        return;
    }

    c.bench_function("metadata_blob_decode_5_runs", |b| {
        b.iter(|| PipelineMetadata::from_blob(black_box(&blob)));
    });
}

fn backoff_benchmark(c: &mut Criterion) {
    let config = RetryConfig::new().with_backoff(BackoffStrategy::Polynomial);
    c.bench_function("polynomial_backoff_delay", |b| {
        b.iter(|| {
            for attempt in 0..8 {
                black_box(config.delay_for(black_box(attempt)));
            }
        });
    });
}

criterion_group!(benches, summary_benchmark, metadata_benchmark, backoff_benchmark);
criterion_main!(benches);
