//! Batch scheduler and worker pool.
//!
//! Records are grouped into fixed-size batches. Each batch is screened in
//! input order, fanned out to at most `workers` concurrent tasks, and joined
//! before anything is persisted. At the batch boundary the rows are tallied,
//! appended to the checkpoint (fsync) and then appended to the outputs, and
//! the proxy pool is checked. A persistence failure halts the run before the
//! next batch.

use crate::config::Config;
use crate::error::{InputError, PersistenceError};
use crate::machine::{PendingRecord, RecordMachine, Screening};
use crate::output::{OutputAggregator, OutputRow};
use crate::progress::ProgressStore;
use crate::record::{normalize_address, Record, Verdict};
use crate::summary::RunSummary;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Checkpointed rows not yet matched against this run's input.
///
/// Keyed by the whole line identity so a repeated address that was not
/// itself checkpointed still goes through duplicate detection.
#[derive(Debug, Default)]
struct ResumeIndex {
    remaining: HashMap<(String, String, String), usize>,
}

impl ResumeIndex {
    fn from_rows(rows: &[OutputRow]) -> Self {
        let mut remaining = HashMap::new();
        for row in rows {
            *remaining
                .entry((row.normalized(), row.secret.clone(), row.source.clone()))
                .or_insert(0) += 1;
        }
        Self { remaining }
    }

    /// True when the record was already finished by an earlier run.
    fn restore(&mut self, record: &Record) -> bool {
        let key = (
            normalize_address(&record.address),
            record.secret.clone(),
            record.source.clone(),
        );
        match self.remaining.get_mut(&key) {
            Some(count) if *count > 0 => {
                *count -= 1;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug, Default)]
struct RunStats {
    rejected: usize,
    resumed: usize,
    processed: usize,
    batches: usize,
}

pub struct BatchScheduler {
    machine: Arc<RecordMachine>,
    progress: ProgressStore,
    output_dir: PathBuf,
    batch_size: usize,
    workers: usize,
    batch_delay: Duration,
    cleanup_on_completion: bool,
    shutdown: Arc<AtomicBool>,
}

impl BatchScheduler {
    pub fn new(config: &Config, machine: RecordMachine, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            machine: Arc::new(machine),
            progress: ProgressStore::new(&config.paths.progress_dir, &config.paths.session),
            output_dir: config.paths.output_dir.clone(),
            batch_size: config.processing.batch_size.max(1),
            workers: config.processing.workers.max(1),
            batch_delay: Duration::from_millis(config.processing.batch_delay_ms),
            cleanup_on_completion: config.processing.cleanup_progress_on_completion,
            shutdown,
        }
    }

    pub fn progress(&self) -> &ProgressStore {
        &self.progress
    }

    /// Drive the input to completion, a shutdown request, or a persistence halt.
    ///
    /// `expected` is the number of candidate lines, when known, for ETA logging.
    pub async fn run<I>(&self, input: I, expected: Option<usize>) -> anyhow::Result<RunSummary>
    where
        I: IntoIterator<Item = Result<Record, InputError>>,
    {
        let started = Instant::now();

        let checkpoint = self.progress.load()?;
        let mut resume = ResumeIndex::from_rows(&checkpoint);
        let mut seen: HashSet<String> = checkpoint.iter().map(OutputRow::normalized).collect();
        let mut summary = RunSummary::new();
        for row in &checkpoint {
            summary.add(row);
        }
        let mut output = OutputAggregator::new(&self.output_dir, checkpoint);

        let mut stats = RunStats::default();
        let mut halt: Option<PersistenceError> = None;
        let mut interrupted = false;
        let mut exhausted = false;
        let mut input = input.into_iter();
        let mut batch = Vec::with_capacity(self.batch_size);

        while !exhausted {
            while batch.len() < self.batch_size {
                match input.next() {
                    Some(Ok(record)) => {
                        if resume.restore(&record) {
                            stats.resumed += 1;
                        } else {
                            batch.push(record);
                        }
                    }
                    Some(Err(e)) => {
                        log::warn!("Rejected input line {e}");
                        stats.rejected += 1;
                    }
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
            if batch.is_empty() {
                break;
            }

            if self.shutdown.load(Ordering::SeqCst) {
                log::warn!("Shutdown requested, not starting batch {}", stats.batches + 1);
                interrupted = true;
                break;
            }

            let rows = self
                .process_batch(std::mem::take(&mut batch), &mut seen)
                .await;
            stats.processed += rows.len();
            stats.batches += 1;

            for row in &rows {
                summary.add(row);
            }
            if let Err(e) = self.commit(&mut output, &rows, &stats, summary.total()) {
                log::error!("Persistence failure, halting run: {e}");
                halt = Some(e);
                break;
            }
            self.machine.proxies().on_batch_boundary();
            self.log_progress(&stats, expected, started.elapsed());

            if !exhausted && !self.batch_delay.is_zero() {
                tokio::time::sleep(self.batch_delay).await;
            }
        }

        if halt.is_none() {
            if let Err(e) = output.flush() {
                log::error!("Persistence failure, halting run: {e}");
                halt = Some(e);
            }
        }

        let completed = halt.is_none() && !interrupted;
        if let Err(e) = self
            .progress
            .write_meta(summary.total(), stats.batches, completed)
        {
            log::warn!("Failed to write progress meta: {e}");
        }
        if completed && self.cleanup_on_completion {
            if let Err(e) = self.progress.cleanup() {
                log::warn!("Failed to clean up progress files: {e}");
            }
        }

        let proxies = self.machine.proxies().snapshot();
        log::info!(
            "Proxy pool: {} total, {} healthy, {} quarantined",
            proxies.total,
            proxies.healthy,
            proxies.quarantined
        );

        summary.rejected = stats.rejected;
        summary.resumed = stats.resumed;
        summary.processed = stats.processed;
        summary.elapsed = started.elapsed();
        summary.interrupted = interrupted;
        summary.halt_reason = halt.map(|e| e.to_string());
        summary.proxies = Some(proxies);
        Ok(summary)
    }

    /// Screen in input order, resolve concurrently, return rows in input order.
    async fn process_batch(&self, batch: Vec<Record>, seen: &mut HashSet<String>) -> Vec<OutputRow> {
        let mut finished: Vec<Option<Record>> = vec![None; batch.len()];
        let mut fallbacks = Vec::new();
        let mut pending = Vec::new();

        for (index, record) in batch.into_iter().enumerate() {
            match self.machine.screen(record, seen) {
                Screening::Finished(record) => finished[index] = Some(record),
                Screening::Pending(p) => {
                    fallbacks.push((index, p.record().clone()));
                    pending.push((index, p));
                }
            }
        }

        let mut join_set: JoinSet<(usize, Record)> = JoinSet::new();
        let mut queue = pending.into_iter();

        for (index, p) in queue.by_ref().take(self.workers) {
            self.spawn(&mut join_set, index, p);
        }

        // Refill the pool as workers finish
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, record)) => finished[index] = Some(record),
                Err(e) => log::error!("Validation worker failed: {e}"),
            }
            if let Some((index, p)) = queue.next() {
                self.spawn(&mut join_set, index, p);
            }
        }

        for (index, mut record) in fallbacks {
            if finished[index].is_none() {
                record.note("Worker failed before reaching a verdict");
                record.finalize(Verdict::Invalid, 0);
                finished[index] = Some(record);
            }
        }

        finished
            .iter()
            .flatten()
            .filter_map(OutputRow::from_record)
            .collect()
    }

    fn spawn(&self, join_set: &mut JoinSet<(usize, Record)>, index: usize, pending: PendingRecord) {
        let machine = Arc::clone(&self.machine);
        join_set.spawn(async move { (index, machine.resolve(pending).await) });
    }

    /// Checkpoint first, then outputs. Rows that miss the checkpoint are
    /// still flushed to the outputs before the error is returned.
    fn commit(
        &self,
        output: &mut OutputAggregator,
        rows: &[OutputRow],
        stats: &RunStats,
        finished: usize,
    ) -> Result<(), PersistenceError> {
        if let Err(e) = self.progress.append(rows) {
            if let Err(flush) = output.append(rows) {
                log::error!("Output flush after halt failed: {flush}");
            }
            return Err(e);
        }
        output.append(rows)?;
        self.progress.write_meta(finished, stats.batches, false)
    }

    fn log_progress(&self, stats: &RunStats, expected: Option<usize>, elapsed: Duration) {
        let Some(total) = expected else {
            log::info!(
                "Batch {} complete: {} records processed",
                stats.batches,
                stats.processed
            );
            return;
        };

        let done = stats.processed + stats.resumed + stats.rejected;
        let remaining = total.saturating_sub(done);
        let rate = stats.processed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        let eta = if rate > 0.0 { remaining as f64 / rate } else { 0.0 };
        let percent = if total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / total as f64
        };

        log::info!(
            "Batch {} complete: {done}/{total} ({percent:.1}%), {:.2} records/s, ETA {:.0}s",
            stats.batches,
            rate,
            eta
        );
    }
}
