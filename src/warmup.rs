//! Warmup scheduler (§4.9): periodic full-key refresh per rule, with a
//! per-rule parallelism cap on top of the revalidator's global budget.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::info;

use crate::disk::DiskTier;
use crate::entry::RevalidatedBy;
use crate::origin::OriginFetcher;
use crate::ram::RamTier;
use crate::revalidate::{revalidate_once, RevalidationOutcome, Revalidator};
use crate::rules::Rule;

#[derive(Debug, Default, Clone, Copy)]
struct Buckets {
    unchanged: u64,
    updated: u64,
    ignored_status: u64,
    ignored_cc: u64,
    errors: u64,
}

impl Buckets {
    fn record(&mut self, outcome: RevalidationOutcome) {
        match outcome {
            RevalidationOutcome::Unchanged => self.unchanged += 1,
            RevalidationOutcome::Updated => self.updated += 1,
            RevalidationOutcome::IgnoredStatus => self.ignored_status += 1,
            RevalidationOutcome::IgnoredCc => self.ignored_cc += 1,
            RevalidationOutcome::Error => self.errors += 1,
        }
    }

    fn deleted(&self) -> u64 {
        self.ignored_status + self.ignored_cc
    }
}

/// Spawns one ticking task per rule that carries a warmup descriptor.
pub fn spawn_warmup_tasks(
    rules: Vec<Rule>,
    ram: Arc<RamTier>,
    disk: Arc<DiskTier>,
    origin: Arc<OriginFetcher>,
    revalidator: Arc<Revalidator>,
    log_warmup: bool,
    mut stop: tokio::sync::watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for rule in rules {
        let Some(descriptor) = rule.warmup.clone() else {
            continue;
        };
        let ram = Arc::clone(&ram);
        let disk = Arc::clone(&disk);
        let origin = Arc::clone(&origin);
        let revalidator = Arc::clone(&revalidator);
        let mut stop = stop.clone();
        let prefixes = rule.prefixes.clone();

        let handle = tokio::spawn(async move {
            let per_rule_semaphore = Arc::new(Semaphore::new(descriptor.max_requests_at_a_time.max(1)));
            let mut ticker = tokio::time::interval(descriptor.run_every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_warmup_tick(&prefixes, &ram, &disk, &origin, &revalidator, &per_rule_semaphore, log_warmup).await;
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        handles.push(handle);
    }
    handles
}

async fn run_warmup_tick(
    prefixes: &[String],
    ram: &Arc<RamTier>,
    disk: &Arc<DiskTier>,
    origin: &Arc<OriginFetcher>,
    revalidator: &Arc<Revalidator>,
    per_rule_semaphore: &Arc<Semaphore>,
    log_warmup: bool,
) {
    let started = Instant::now();

    let mut keys: BTreeSet<String> = ram.keys().into_iter().collect();
    keys.extend(disk.keys());

    let matching: Vec<String> = keys.into_iter().filter(|k| prefixes.iter().any(|p| k.starts_with(p.as_str()))).collect();

    if matching.is_empty() {
        return;
    }

    let mut tasks = Vec::with_capacity(matching.len());
    for key in matching.iter().cloned() {
        let ram = Arc::clone(ram);
        let disk = Arc::clone(disk);
        let origin = Arc::clone(origin);
        let revalidator = Arc::clone(revalidator);
        let rule_permit = Arc::clone(per_rule_semaphore).acquire_owned().await.expect("semaphore not closed");

        tasks.push(tokio::spawn(async move {
            let _rule_permit = rule_permit;
            let Some(_global_permit) = revalidator.try_acquire_permit() else {
                return (key, None);
            };
            let path = key.clone();
            let outcome = revalidate_once(&key, &path, "", RevalidatedBy::Warmup, &ram, &disk, &origin).await;
            (key, Some(outcome))
        }));
    }

    let mut response_times = Vec::with_capacity(tasks.len());
    let mut buckets = Buckets::default();
    for task in tasks {
        let task_started = Instant::now();
        if let Ok((_, outcome)) = task.await {
            match outcome {
                Some(o) => buckets.record(o),
                None => buckets.errors += 1,
            }
            response_times.push(task_started.elapsed());
        }
    }

    let duration = started.elapsed();
    let total = matching.len() as u64;

    if log_warmup {
        let rps = if duration.as_secs_f64() > 0.0 { total as f64 / duration.as_secs_f64() } else { 0.0 };
        let (min, avg, max) = response_time_stats(&response_times);
        info!(
            total_urls = total,
            unchanged = buckets.unchanged,
            updated = buckets.updated,
            deleted = buckets.deleted(),
            ignored_status = buckets.ignored_status,
            ignored_cc = buckets.ignored_cc,
            errors = buckets.errors,
            duration_ms = duration.as_millis(),
            rps,
            resp_min_ms = min,
            resp_avg_ms = avg,
            resp_max_ms = max,
            "warmup tick complete"
        );
    }
}

fn response_time_stats(times: &[Duration]) -> (f64, f64, f64) {
    if times.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let millis: Vec<f64> = times.iter().map(|d| d.as_secs_f64() * 1000.0).collect();
    let min = millis.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = millis.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let avg = millis.iter().sum::<f64>() / millis.len() as f64;
    (min, avg, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_deleted_is_sum_of_status_and_cc() {
        let mut b = Buckets::default();
        b.record(RevalidationOutcome::IgnoredStatus);
        b.record(RevalidationOutcome::IgnoredCc);
        b.record(RevalidationOutcome::Unchanged);
        assert_eq!(b.deleted(), 2);
        assert_eq!(b.unchanged, 1);
    }

    #[test]
    fn response_time_stats_handles_empty() {
        assert_eq!(response_time_stats(&[]), (0.0, 0.0, 0.0));
    }
}
