use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use pagecompiler_service::config::Config;
use pagecompiler_service::{CompilerEvent, Lookup, PageCompiler};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{SyntheticDriver, WorkloadsConfig};

type Compiler = PageCompiler<SyntheticDriver>;

#[derive(Debug, Clone, Copy)]
enum Outcome {
    /// The page was already cached.
    Hit,
    /// The page had to be compiled first.
    Compiled,
    Failed,
    Missed,
}

#[derive(Default)]
struct Stats {
    durations: DDSketch,
    hits: usize,
    compiled: usize,
    failed: usize,
    missed: usize,
}

impl Stats {
    fn record(&mut self, outcome: Outcome, elapsed: Duration) {
        self.durations.add(elapsed.as_secs_f64());
        match outcome {
            Outcome::Hit => self.hits += 1,
            Outcome::Compiled => self.compiled += 1,
            Outcome::Failed => self.failed += 1,
            Outcome::Missed => self.missed += 1,
        }
    }
}

/// Requests `page` until it is available, waiting for the compiler to report back.
async fn request_page(compiler: &Compiler, page: u32) -> Outcome {
    // subscribe first, so the event for our page cannot slip through
    let mut events = compiler.subscribe();
    let mut waited = false;

    loop {
        match compiler.request(page, true) {
            Lookup::Cached(_) if waited => return Outcome::Compiled,
            Lookup::Cached(_) => return Outcome::Hit,
            Lookup::Miss => return Outcome::Missed,
            Lookup::NotReady => waited = true,
        }

        loop {
            match events.recv().await {
                Some(CompilerEvent::Ready { keys, all }) if all || keys.contains(&page) => break,
                Some(CompilerEvent::Failed { key, .. }) if key == page => return Outcome::Failed,
                Some(_) => continue,
                None => return Outcome::Missed,
            }
        }
    }
}

pub async fn perform_stresstest(
    config: &Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // every workload compiles its own document
    let runtime = tokio::runtime::Handle::current();
    let workloads = workloads
        .workloads
        .into_iter()
        .map(|workload| {
            anyhow::ensure!(workload.pages > 0, "workload without pages");
            let driver = SyntheticDriver::new(workload.clone());
            let compiler = PageCompiler::new(driver, &config.compiler, runtime.clone());
            compiler.start().context("failed to start page compiler")?;
            Ok((workload, compiler))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: request the first page of each workload once
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|(_, compiler)| {
            let compiler = compiler.clone();
            tokio::spawn(async move { request_page(&compiler, 0).await })
        });
        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let mut tasks = Vec::with_capacity(workloads.len());
    for (workload, compiler) in workloads.iter().cloned() {
        let start = Instant::now();
        let deadline = tokio::time::Instant::from_std(start + duration);

        let task = tokio::spawn(async move {
            let concurrency = workload.concurrency;
            let stats = Arc::new(Mutex::new(Stats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let compiler = compiler.clone();
                        let stats = Arc::clone(&stats);
                        let page = rand::random_range(0..workload.pages);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let future = async move {
                            let outcome = request_page(&compiler, page).await;
                            stats.lock().unwrap().record(outcome, task_start.elapsed());

                            drop(permit);
                        };

                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the semaphores, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let stats = std::mem::take(&mut *stats.lock().unwrap());
            (concurrency, stats)
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (task, (_, compiler))) in finished_tasks.into_iter().zip(&workloads).enumerate() {
        let (concurrency, stats) = task.context("workload panicked")?;
        let Stats {
            durations,
            hits,
            compiled,
            failed,
            missed,
        } = stats;

        let ops = durations.count();
        let ops_ps = ops as f32 / duration.as_secs_f32();
        println!("Workload {i} (concurrency: {concurrency}): {ops} operations, {ops_ps:.2} ops/s");
        println!("  hits: {hits}; compiled: {compiled}; failed: {failed}; missed: {missed}");

        if let (Some(sum), Ok(Some(p50)), Ok(Some(p90)), Ok(Some(p99))) = (
            durations.sum(),
            durations.quantile(0.5),
            durations.quantile(0.9),
            durations.quantile(0.99),
        ) {
            let avg = Duration::from_secs_f64(sum / ops as f64);
            let p50 = Duration::from_secs_f64(p50);
            let p90 = Duration::from_secs_f64(p90);
            let p99 = Duration::from_secs_f64(p99);
            println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
        }

        println!(
            "  cache: {} pages, {} of {} bytes",
            compiler.cached_pages(),
            compiler.cache_cost(),
            compiler.cache_limit()
        );
        compiler.stop().context("failed to stop page compiler")?;
    }

    Ok(())
}
