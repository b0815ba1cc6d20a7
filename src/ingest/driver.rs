use std::collections::HashSet;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::error::MastrError;
use crate::ingest::blacklist::Blacklist;
use crate::ingest::record::Record;
use crate::ingest::sink::{CsvSink, FailSink, FailStage};
use crate::soap::fetcher::Fetcher;
use crate::soap::quota::Quota;

/// Attempts per id: two in the download pass, the third in the retry pass.
pub const MAX_ATTEMPTS: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// one id after the other, sink order equals input order
    Serial,
    /// a pool with this many worker threads, no ordering guarantee
    Parallel(usize),
}

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    pub mode: Mode,
    /// Longest tolerated gap between two successful fetches
    pub liveness_timeout: Duration,
    /// Stop cleanly while the wall clock is inside one of these windows
    pub blacklist: Option<Blacklist>,
    /// Quota read at batch start, caps the number of calls of the run
    pub quota: Option<Quota>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            mode: Mode::Serial,
            liveness_timeout: Duration::from_secs(600),
            blacklist: None,
            quota: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// stopped at a blacklist window, resume later
    Blacklisted,
    /// the daily quota was used up before or during the run
    QuotaExhausted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: Outcome,
    pub fetched: usize,
    pub second_fails: usize,
    pub third_fails: usize,
    pub calls: u64,
}

impl RunReport {
    fn new() -> Self {
        RunReport {
            outcome: Outcome::Completed,
            fetched: 0,
            second_fails: 0,
            third_fails: 0,
            calls: 0,
        }
    }
}

fn touch(last_success: &Mutex<Instant>) {
    let mut t = last_success.lock().unwrap_or_else(|e| e.into_inner());
    *t = Instant::now();
}

/// State of one batch: the liveness clock, the call budget and the counters.
struct Run<'a> {
    options: &'a DownloadOptions,
    last_success: Arc<Mutex<Instant>>,
    budget: Option<u64>,
    report: RunReport,
}

impl<'a> Run<'a> {
    fn new(options: &'a DownloadOptions) -> Self {
        Run {
            options,
            last_success: Arc::new(Mutex::new(Instant::now())),
            budget: options.quota.map(|q| q.remaining()),
            report: RunReport::new(),
        }
    }

    fn idle(&self) -> Duration {
        self.last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }

    fn check_liveness(&self) -> Result<(), MastrError> {
        let idle = self.idle();
        if idle > self.options.liveness_timeout {
            error!(
                "no successful fetch for {:?} (limit {:?}), aborting",
                idle, self.options.liveness_timeout
            );
            return Err(MastrError::ConnectionAborted(idle));
        }
        Ok(())
    }

    /// Checked before every dispatch.  `Some` means stop cleanly.
    fn check(&self) -> Result<Option<Outcome>, MastrError> {
        self.check_liveness()?;
        if let Some(blacklist) = &self.options.blacklist {
            if blacklist.is_blocked_now() {
                info!("inside a blacklist window, stopping");
                return Ok(Some(Outcome::Blacklisted));
            }
        }
        if let Some(budget) = self.budget {
            if self.report.calls >= budget {
                warn!("daily quota used up after {} calls, stopping", self.report.calls);
                return Ok(Some(Outcome::QuotaExhausted));
            }
        }
        Ok(None)
    }

    fn attempt(&mut self, fetcher: &dyn Fetcher, id: &str) -> Option<Record> {
        self.report.calls += 1;
        let record = fetcher.fetch(id);
        if record.is_some() {
            touch(&self.last_success);
        }
        record
    }

    fn count_fail(&mut self, stage: FailStage) {
        match stage {
            FailStage::Second => self.report.second_fails += 1,
            FailStage::Third => self.report.third_fails += 1,
        }
    }

    /// Up to `attempts` tries per id, in input order.  Ids failing all of them are
    /// logged to `fail_sink` with `stage`.
    fn serial(
        &mut self,
        ids: &[String],
        fetcher: &dyn Fetcher,
        attempts: u32,
        stage: FailStage,
        sink: &CsvSink,
        fail_sink: &FailSink,
    ) -> Result<Option<Outcome>, MastrError> {
        'ids: for id in ids {
            for n in 1..=attempts {
                if let Some(stop) = self.check()? {
                    return Ok(Some(stop));
                }
                if let Some(record) = self.attempt(fetcher, id) {
                    sink.append(&record)?;
                    self.report.fetched += 1;
                    continue 'ids;
                }
                debug!("{}: attempt {} of {} failed", id, n, attempts);
            }
            fail_sink.append(id, stage)?;
            self.count_fail(stage);
        }
        Ok(None)
    }

    /// One attempt per id on a pool of `threads` workers.  Results come back over a
    /// channel and are written here, so the sink has a single writer.  Returns the
    /// ids that failed.
    fn parallel_pass(
        &mut self,
        ids: Vec<String>,
        fetcher: Arc<dyn Fetcher>,
        threads: usize,
        sink: &CsvSink,
    ) -> Result<(Vec<String>, Option<Outcome>), MastrError> {
        if ids.is_empty() {
            return Ok((Vec::new(), None));
        }
        let threads = threads.clamp(1, ids.len());
        let (job_tx, job_rx) = mpsc::channel::<String>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let (result_tx, result_rx) = mpsc::channel::<(String, Option<Record>)>();
        for i in 0..threads {
            let job_rx = job_rx.clone();
            let result_tx = result_tx.clone();
            let fetcher = fetcher.clone();
            let last_success = self.last_success.clone();
            thread::Builder::new()
                .name(format!("mastr-worker-{}", i))
                .spawn(move || loop {
                    let job = {
                        let rx = job_rx.lock().unwrap_or_else(|e| e.into_inner());
                        rx.recv()
                    };
                    let Ok(id) = job else { break };
                    let record = fetcher.fetch(&id);
                    if record.is_some() {
                        touch(&last_success);
                    }
                    if result_tx.send((id, record)).is_err() {
                        break;
                    }
                })?;
        }
        drop(result_tx);

        let mut pending = ids.into_iter();
        let mut in_flight = 0usize;
        let mut failed = Vec::new();
        let mut stop = None;

        while in_flight < threads {
            if let Some(s) = self.check()? {
                stop = Some(s);
                break;
            }
            let Some(id) = pending.next() else { break };
            if job_tx.send(id).is_err() {
                break;
            }
            self.report.calls += 1;
            in_flight += 1;
        }

        while in_flight > 0 {
            let wait = self
                .options
                .liveness_timeout
                .saturating_sub(self.idle())
                + Duration::from_millis(1);
            match result_rx.recv_timeout(wait) {
                Ok((_, Some(record))) => {
                    in_flight -= 1;
                    sink.append(&record)?;
                    self.report.fetched += 1;
                }
                Ok((id, None)) => {
                    in_flight -= 1;
                    debug!("{}: attempt failed", id);
                    failed.push(id);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            // ids in flight are drained after a clean stop, never cancelled
            if stop.is_some() {
                self.check_liveness()?;
                continue;
            }
            match self.check()? {
                Some(s) => stop = Some(s),
                None => {
                    if let Some(id) = pending.next() {
                        if job_tx.send(id).is_ok() {
                            self.report.calls += 1;
                            in_flight += 1;
                        }
                    }
                }
            }
        }
        drop(job_tx);
        Ok((failed, stop))
    }

    fn finish(mut self, stop: Option<Outcome>) -> RunReport {
        self.report.outcome = stop.unwrap_or(Outcome::Completed);
        self.report
    }
}

/// Drives lists of ids through a [`Fetcher`] with the fixed three-attempt policy.
pub struct Driver {
    options: DownloadOptions,
}

impl Driver {
    pub fn new(options: DownloadOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    fn refuse_exhausted(&self) -> Option<RunReport> {
        match self.options.quota {
            Some(quota) if quota.is_exhausted() => {
                warn!(
                    "daily quota exhausted ({} of {}), not starting",
                    quota.used, quota.limit
                );
                let mut report = RunReport::new();
                report.outcome = Outcome::QuotaExhausted;
                Some(report)
            }
            _ => None,
        }
    }

    /// Attempts one and two for every id.  Ids failing both get a `Second fail` record.
    /// A liveness timeout is fatal, a blacklist window or a spent quota stop cleanly.
    pub fn download(
        &self,
        ids: &[String],
        fetcher: Arc<dyn Fetcher>,
        sink: &CsvSink,
        fail_sink: &FailSink,
    ) -> Result<RunReport, MastrError> {
        if let Some(report) = self.refuse_exhausted() {
            return Ok(report);
        }
        info!(
            "downloading {} ids into {} ({:?})",
            ids.len(),
            sink.path().display(),
            self.options.mode
        );
        let mut run = Run::new(&self.options);
        let stop = match self.options.mode {
            Mode::Serial => run.serial(
                ids,
                fetcher.as_ref(),
                MAX_ATTEMPTS - 1,
                FailStage::Second,
                sink,
                fail_sink,
            )?,
            Mode::Parallel(threads) => {
                let (failed, stop) = run.parallel_pass(ids.to_vec(), fetcher.clone(), threads, sink)?;
                if stop.is_some() {
                    stop
                } else {
                    let (failed, stop) = run.parallel_pass(failed, fetcher, threads, sink)?;
                    // a clean stop leaves some ids with one attempt only, a re-run picks them up
                    if stop.is_none() {
                        for id in &failed {
                            fail_sink.append(id, FailStage::Second)?;
                            run.count_fail(FailStage::Second);
                        }
                    }
                    stop
                }
            }
        };
        let report = run.finish(stop);
        info!(
            "{} fetched, {} second fails, {} calls, {:?}",
            report.fetched, report.second_fails, report.calls, report.outcome
        );
        Ok(report)
    }

    /// Ids with a `Second fail` and neither a `Third fail` nor a row in `sink` yet,
    /// in first-failure order.
    pub fn pending_retries(
        fail_sink: &FailSink,
        sink: &CsvSink,
        key_column: &str,
    ) -> Result<Vec<String>, MastrError> {
        let fails = fail_sink.read_all()?;
        let mut done: HashSet<String> = fails
            .iter()
            .filter(|f| f.comment == FailStage::Third)
            .map(|f| f.id.clone())
            .collect();
        done.extend(sink.column_values(key_column)?);
        let mut pending = Vec::new();
        for f in fails.into_iter().filter(|f| f.comment == FailStage::Second) {
            if done.insert(f.id.clone()) {
                pending.push(f.id);
            }
        }
        Ok(pending)
    }

    /// The third and last attempt for every pending id of the fail store.
    pub fn retry(
        &self,
        fetcher: Arc<dyn Fetcher>,
        sink: &CsvSink,
        fail_sink: &FailSink,
        key_column: &str,
    ) -> Result<RunReport, MastrError> {
        if let Some(report) = self.refuse_exhausted() {
            return Ok(report);
        }
        let ids = Driver::pending_retries(fail_sink, sink, key_column)?;
        info!("retrying {} ids from {}", ids.len(), fail_sink.path().display());
        let mut run = Run::new(&self.options);
        let stop = match self.options.mode {
            Mode::Serial => run.serial(&ids, fetcher.as_ref(), 1, FailStage::Third, sink, fail_sink)?,
            Mode::Parallel(threads) => {
                let (failed, stop) = run.parallel_pass(ids, fetcher, threads, sink)?;
                for id in &failed {
                    fail_sink.append(id, FailStage::Third)?;
                    run.count_fail(FailStage::Third);
                }
                stop
            }
        };
        let report = run.finish(stop);
        info!(
            "retry: {} fetched, {} third fails, {:?}",
            report.fetched, report.third_fails, report.outcome
        );
        Ok(report)
    }
}
