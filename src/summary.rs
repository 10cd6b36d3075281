use crate::output::OutputRow;
use crate::proxy::PoolSnapshot;
use crate::record::Verdict;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// End-of-run report. Counts cover the whole session, resumed rows included.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub counts: BTreeMap<Verdict, usize>,
    /// Input lines that never became records
    pub rejected: usize,
    /// Records filtered out because an earlier run checkpointed them
    pub resumed: usize,
    /// Records validated by this run
    pub processed: usize,
    pub countries: BTreeMap<String, usize>,
    score_total: u64,
    scored: u64,
    pub elapsed: Duration,
    /// Stopped early on a shutdown request; a later run resumes from the checkpoint
    pub interrupted: bool,
    pub halt_reason: Option<String>,
    pub proxies: Option<PoolSnapshot>,
}

impl RunSummary {
    /// Empty tally with a zero count for every verdict.
    pub fn new() -> Self {
        Self {
            counts: Verdict::ALL.iter().map(|v| (*v, 0)).collect(),
            ..Self::default()
        }
    }

    /// Fold one finished row into the session counts.
    pub fn add(&mut self, row: &OutputRow) {
        *self.counts.entry(row.verdict).or_default() += 1;
        if row.verdict == Verdict::Valid {
            *self.countries.entry(row.country.clone()).or_insert(0) += 1;
        }
        if row.verdict.is_live() {
            self.score_total += u64::from(row.score);
            self.scored += 1;
        }
    }

    /// Mean quality score over live verdicts; skipped rows are not scored.
    pub fn average_score(&self) -> f64 {
        if self.scored == 0 {
            0.0
        } else {
            self.score_total as f64 / self.scored as f64
        }
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn count(&self, verdict: Verdict) -> usize {
        self.counts.get(&verdict).copied().unwrap_or(0)
    }

    pub fn is_halted(&self) -> bool {
        self.halt_reason.is_some()
    }

    /// Records per second validated by this run
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "📊 Validation Summary")?;
        writeln!(f, "═══════════════════════════════════════")?;
        writeln!(f, "  Total records:     {}", self.total())?;
        for (verdict, count) in &self.counts {
            writeln!(f, "  {:<18} {}", format!("{verdict}:"), count)?;
        }
        writeln!(f, "  Rejected lines:    {}", self.rejected)?;
        writeln!(f, "  Resumed records:   {}", self.resumed)?;
        writeln!(f, "  Average score:     {:.1}", self.average_score())?;
        writeln!(
            f,
            "  Elapsed:           {:.1}s ({} processed, {:.2}/s)",
            self.elapsed.as_secs_f64(),
            self.processed,
            self.throughput()
        )?;

        if !self.countries.is_empty() {
            writeln!(f)?;
            writeln!(f, "🌍 Valid addresses by country:")?;
            let mut by_count: Vec<_> = self.countries.iter().collect();
            by_count.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
            for (country, count) in by_count {
                writeln!(f, "  {country}: {count}")?;
            }
        }

        if let Some(proxies) = &self.proxies {
            if proxies.total > 0 {
                writeln!(f)?;
                writeln!(
                    f,
                    "🔀 Proxies: {} healthy, {} quarantined",
                    proxies.healthy, proxies.quarantined
                )?;
                for (endpoint, health, stats) in &proxies.stats {
                    writeln!(
                        f,
                        "  {endpoint} [{health:?}] {} requests, {} ok, {} failed",
                        stats.total_requests, stats.successful_requests, stats.failed_requests
                    )?;
                }
            }
        }

        if self.interrupted {
            writeln!(f)?;
            writeln!(f, "⚠️  Run interrupted, rerun to resume from the checkpoint")?;
        }

        if let Some(reason) = &self.halt_reason {
            writeln!(f)?;
            writeln!(f, "❌ Run halted: {reason}")?;
        }
        Ok(())
    }
}
