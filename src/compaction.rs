//! Age-tiered compaction of repository directories.
//!
//! Ingestion leaves many fine-grained files behind; the compactor folds them
//! into calendar buckets as they age. Days before today collapse into day
//! files, months before the current one into month files, years before the
//! current one into year files. A directory converges towards one file per
//! bucket over repeated passes, and every pass is safe to interrupt: merges
//! publish atomically, and inputs are only removed on a later pass once the
//! covering file has demonstrably settled.

use std::{collections::BTreeMap, io, path::Path};

use chrono::{DateTime, Datelike, Utc};
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    id::FileId,
    repository::{LocalRepository, RecordsRepository, RecordsWriter, RepositoryError},
    timekey::{TimeInterval, TimeKey},
};

/// Errors aborting a directory pass.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Directory listing failure.
    #[error("compaction io error: {0}")]
    Io(#[from] io::Error),
    /// Repository failure while renaming, merging or removing.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Outcome counts of one directory pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CompactionReport {
    /// Buckets merged from several inputs into one coarse file.
    pub merged: usize,
    /// Single-file buckets renamed to their coarse name.
    pub renamed: usize,
    /// Shadowed files removed.
    pub removed: usize,
    /// Shadowed files left in place while their shadow is still fresh.
    pub deferred: usize,
    /// Files left in place by the containment gate, an unreadable shadow or
    /// a failed removal.
    pub skipped: usize,
}

/// Folds fine-grained files into calendar buckets, one directory at a time.
pub struct Compactor {
    repository: LocalRepository,
}

impl Compactor {
    pub fn new(repository: LocalRepository) -> Self {
        Self { repository }
    }

    /// Compacts one leaf directory against the current wall clock.
    pub async fn index_directory(
        &self,
        directory: &Path,
    ) -> Result<CompactionReport, CompactionError> {
        self.index_directory_as_of(directory, Utc::now()).await
    }

    /// Compacts one leaf directory as if the clock read `now`. Bucket
    /// boundaries derive from `now`; freshness still compares `now` against
    /// real file modification times.
    pub async fn index_directory_as_of(
        &self,
        directory: &Path,
        now: DateTime<Utc>,
    ) -> Result<CompactionReport, CompactionError> {
        let entries = self.repository.directory_entries(directory)?;
        let plan = plan(entries, now);
        let mut report = CompactionReport::default();
        // removals first: merge products from this very pass stay fresh and
        // are retired by a later one
        self.apply_removals(&plan, now, &mut report).await;
        self.apply_merges(&plan, &mut report).await?;
        Ok(report)
    }

    async fn apply_removals(&self, plan: &Plan, now: DateTime<Utc>, report: &mut CompactionReport) {
        for (shadow, candidates) in &plan.to_remove {
            let modified = match self.repository.modified(shadow).await {
                Ok(modified) => modified,
                Err(error) => {
                    warn!(shadow = %shadow, %error, "shadow unreadable, skipping its removals");
                    report.skipped += candidates.len();
                    continue;
                }
            };
            let age = now.signed_duration_since(DateTime::<Utc>::from(modified));
            if age < self.repository.option().freshness_threshold {
                debug!(
                    shadow = %shadow,
                    candidates = candidates.len(),
                    "shadow still fresh, deferring removals"
                );
                report.deferred += candidates.len();
                continue;
            }
            let coverage = shadow.time.interval();
            for candidate in candidates {
                if !coverage.contains(&candidate.time.interval()) {
                    warn!(
                        file = %candidate,
                        shadow = %shadow,
                        "claim not contained by shadow, skipping removal"
                    );
                    report.skipped += 1;
                    continue;
                }
                match self.repository.remove(candidate).await {
                    Ok(()) => {
                        info!(file = %candidate, shadow = %shadow, "removed shadowed file");
                        report.removed += 1;
                    }
                    Err(error) => {
                        warn!(file = %candidate, %error, "removal failed, leaving for next pass");
                        report.skipped += 1;
                    }
                }
            }
        }
    }

    async fn apply_merges(
        &self,
        plan: &Plan,
        report: &mut CompactionReport,
    ) -> Result<(), CompactionError> {
        for (bucket, inputs) in &plan.to_index {
            match inputs.as_slice() {
                [] => {}
                [only] if only.time == *bucket => {}
                [only] => {
                    let target = only.with_time(*bucket);
                    self.repository.rename(only, &target).await?;
                    info!(from = %only, to = %target, "renamed to coarse file");
                    report.renamed += 1;
                }
                inputs => {
                    let target = inputs[0].with_time(*bucket);
                    let mut writer = self.repository.writer(&target);
                    for input in inputs {
                        let mut stream = self.repository.batch_stream(input).await?;
                        while let Some(batch) = stream.next().await {
                            writer.write(batch.map_err(RepositoryError::from)?).await?;
                        }
                    }
                    writer.close().await?;
                    info!(bucket = %target, inputs = inputs.len(), "merged bucket");
                    report.merged += 1;
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Plan {
    /// Bucket key to its input files, in sweep order.
    to_index: BTreeMap<TimeKey, Vec<FileId>>,
    /// Shadow file to the files its claim fully covers.
    to_remove: BTreeMap<FileId, Vec<FileId>>,
}

/// Sweeps a directory's entries into merge buckets and removal groups.
///
/// Entries walk in `(claim start ascending, claim end descending)` order, so
/// of two claims starting together the longer one leads. A file whose claim
/// the current shadow's claim contains is recorded for removal under that
/// shadow; every other file becomes the new shadow and is routed to its
/// target bucket. Containment is half-open: a point claim sitting exactly
/// on a shadow's exclusive end belongs to the next period, so it leads its
/// own bucket instead of falling to a file that never absorbed its rows.
fn plan(entries: Vec<FileId>, now: DateTime<Utc>) -> Plan {
    let boundaries = Boundaries::at(now);
    let mut spans: Vec<(FileId, TimeInterval)> = entries
        .into_iter()
        .map(|file| {
            let claim = file.time.interval();
            (file, claim)
        })
        .collect();
    spans.sort_by(|(_, a), (_, b)| a.start().cmp(&b.start()).then(b.end().cmp(&a.end())));

    let mut plan = Plan::default();
    let mut shadow: Option<(FileId, TimeInterval)> = None;
    for (file, claim) in spans {
        match &shadow {
            Some((owner, coverage)) if coverage.contains(&claim) => {
                plan.to_remove
                    .entry(owner.clone())
                    .or_default()
                    .push(file);
            }
            _ => {
                if let Some(bucket) = boundaries.target_bucket(&claim) {
                    plan.to_index.entry(bucket).or_default().push(file.clone());
                }
                shadow = Some((file, claim));
            }
        }
    }
    plan
}

/// Policy boundaries cut from one observation of the clock.
struct Boundaries {
    daily: DateTime<Utc>,
    monthly: DateTime<Utc>,
    yearly: DateTime<Utc>,
}

impl Boundaries {
    fn at(now: DateTime<Utc>) -> Self {
        Boundaries {
            daily: TimeKey::Day(now.year(), now.month(), now.day())
                .interval()
                .start(),
            monthly: TimeKey::Month(now.year(), now.month()).interval().start(),
            yearly: TimeKey::Year(now.year()).interval().start(),
        }
    }

    /// Bucket a claim belongs in, `None` when the file stays untouched:
    /// either it is already as coarse as its age allows, or it is from today.
    fn target_bucket(&self, claim: &TimeInterval) -> Option<TimeKey> {
        let start = claim.start();
        if start < self.yearly {
            (!claim.is_year()).then(|| TimeKey::Year(start.year()))
        } else if start < self.monthly {
            (!claim.is_month()).then(|| TimeKey::Month(start.year(), start.month()))
        } else if start < self.daily {
            (!claim.is_day()).then(|| TimeKey::Day(start.year(), start.month(), start.day()))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use arrow::{
        array::{RecordBatch, TimestampNanosecondArray},
        datatypes::{DataType, Field, Schema, TimeUnit},
    };
    use chrono::TimeZone;
    use tempfile::TempDir;

    use super::*;
    use crate::{option::StoreOption, schema::TIME_COLUMN};

    fn id(canonical: &str) -> FileId {
        canonical.parse().unwrap()
    }

    fn at(canonical: &str) -> DateTime<Utc> {
        canonical.parse().unwrap()
    }

    #[test]
    fn buckets_follow_age_tiers() {
        // mid-March 2021: yearly = 2021-01-01, monthly = 2021-03-01,
        // daily = 2021-03-15
        let boundaries = Boundaries::at(at("2021-03-15T12:00:00Z"));
        let bucket = |key: TimeKey| boundaries.target_bucket(&key.interval());

        assert_eq!(
            bucket(TimeKey::Day(2020, 5, 6)),
            Some(TimeKey::Year(2020))
        );
        assert_eq!(
            bucket(TimeKey::Month(2020, 5)),
            Some(TimeKey::Year(2020))
        );
        assert_eq!(bucket(TimeKey::Year(2020)), None);

        assert_eq!(
            bucket(TimeKey::Day(2021, 1, 20)),
            Some(TimeKey::Month(2021, 1))
        );
        assert_eq!(bucket(TimeKey::Month(2021, 1)), None);

        assert_eq!(
            bucket(TimeKey::Instant(at("2021-03-04T05:06:07Z"))),
            Some(TimeKey::Day(2021, 3, 4))
        );
        assert_eq!(bucket(TimeKey::Day(2021, 3, 4)), None);

        // today stays untouched at any granularity
        assert_eq!(bucket(TimeKey::Instant(at("2021-03-15T00:00:01Z"))), None);
        assert_eq!(bucket(TimeKey::Day(2021, 3, 15)), None);
    }

    #[test]
    fn sweep_shadows_everything_a_year_file_covers() {
        let year = id("trades:kraken-rest:kraken:btc/eur:2020");
        let month = id("trades:kraken-rest:kraken:btc/eur:2020-03");
        let day = id("trades:kraken-rest:kraken:btc/eur:2020-03-04");
        let point = id("trades:kraken-rest:kraken:btc/eur:2020-07-01T12:00:00.000000000Z");

        let plan = plan(
            vec![point.clone(), day.clone(), year.clone(), month.clone()],
            at("2021-03-15T12:00:00Z"),
        );

        assert!(plan.to_index.is_empty());
        assert_eq!(
            plan.to_remove.get(&year),
            Some(&vec![month, day, point])
        );
    }

    #[test]
    fn sweep_attributes_candidates_to_their_own_shadow() {
        let january = id("trades:kraken-rest:kraken:btc/eur:2020-01");
        let february = id("trades:kraken-rest:kraken:btc/eur:2020-02");
        let in_january = id("trades:kraken-rest:kraken:btc/eur:2020-01-15");
        let in_february = id("trades:kraken-rest:kraken:btc/eur:2020-02-10");

        let plan = plan(
            vec![
                in_february.clone(),
                january.clone(),
                in_january.clone(),
                february.clone(),
            ],
            at("2021-03-15T12:00:00Z"),
        );

        assert_eq!(
            plan.to_index.get(&TimeKey::Year(2020)),
            Some(&vec![january.clone(), february.clone()])
        );
        assert_eq!(plan.to_remove.get(&january), Some(&vec![in_january]));
        assert_eq!(plan.to_remove.get(&february), Some(&vec![in_february]));
    }

    #[test]
    fn sweep_prefers_the_longer_claim_on_equal_starts() {
        let month = id("trades:kraken-rest:kraken:btc/eur:2020-03");
        let first_day = id("trades:kraken-rest:kraken:btc/eur:2020-03-01");

        let plan = plan(
            vec![first_day.clone(), month.clone()],
            at("2021-03-15T12:00:00Z"),
        );

        assert_eq!(plan.to_remove.get(&month), Some(&vec![first_day]));
        assert_eq!(
            plan.to_index.get(&TimeKey::Year(2020)),
            Some(&vec![month])
        );
    }

    #[test]
    fn sweep_never_covers_a_point_on_the_claim_boundary() {
        let month = id("trades:kraken-rest:kraken:btc/eur:2020-03");
        let boundary = id("trades:kraken-rest:kraken:btc/eur:2020-04-01T00:00:00.000000000Z");
        let next_day = id("trades:kraken-rest:kraken:btc/eur:2020-04-01");

        // the month's claim ends exactly where the point sits; the point
        // holds the next period's first rows and leads its own bucket
        let lone = plan(
            vec![month.clone(), boundary.clone()],
            at("2021-03-15T12:00:00Z"),
        );
        assert!(lone.to_remove.is_empty());
        assert_eq!(
            lone.to_index.get(&TimeKey::Year(2020)),
            Some(&vec![month.clone(), boundary.clone()])
        );

        // under a claim that includes its moment it is covered as usual
        let covered = plan(
            vec![month.clone(), next_day.clone(), boundary.clone()],
            at("2021-03-15T12:00:00Z"),
        );
        assert_eq!(covered.to_remove.get(&next_day), Some(&vec![boundary]));
        assert_eq!(
            covered.to_index.get(&TimeKey::Year(2020)),
            Some(&vec![month, next_day])
        );
    }

    fn sample_batch(times: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            TIME_COLUMN,
            DataType::Timestamp(TimeUnit::Nanosecond, Some("UTC".into())),
            false,
        )]));
        let times = TimestampNanosecondArray::from(times.to_vec()).with_timezone("UTC");
        RecordBatch::try_new(schema, vec![Arc::new(times)]).unwrap()
    }

    async fn store(repository: &LocalRepository, file: &FileId, times: &[i64]) {
        let mut writer = repository.writer(file);
        writer.write(sample_batch(times)).await.unwrap();
        writer.close().await.unwrap();
    }

    fn age_file(repository: &LocalRepository, file: &FileId, seconds: u64) {
        let handle = std::fs::File::options()
            .write(true)
            .open(repository.path_of(file))
            .unwrap();
        handle
            .set_modified(std::time::SystemTime::now() - std::time::Duration::from_secs(seconds))
            .unwrap();
    }

    #[tokio::test]
    async fn passes_converge_to_one_file_per_bucket() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        let now = Utc::now();
        let year = now.year() - 1;
        let days: Vec<FileId> = (1..=4)
            .map(|day| {
                format!("trades:kraken-rest:kraken:btc/eur:{year}-06-{day:02}")
                    .parse()
                    .unwrap()
            })
            .collect();
        let base = Utc
            .with_ymd_and_hms(year, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        for (index, day) in days.iter().enumerate() {
            store(&repository, day, &[base + index as i64, base + index as i64 + 1]).await;
        }
        let directory = repository.path_of(&days[0]).parent().unwrap().to_path_buf();

        // first pass merges the bucket; inputs stay behind the fresh product
        let report = compactor.index_directory(&directory).await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.removed, 0);

        let merged = days[0].with_time(TimeKey::Year(year));
        assert_eq!(repository.get(&merged).await.unwrap().num_rows(), 8);

        // second pass defers removals while the product is fresh
        let report = compactor.index_directory(&directory).await.unwrap();
        assert_eq!(report.merged, 0);
        assert_eq!(report.deferred, days.len());

        // once the product has settled the inputs are retired
        age_file(&repository, &merged, 600);
        let report = compactor.index_directory(&directory).await.unwrap();
        assert_eq!(report.removed, days.len());

        let report = compactor.index_directory(&directory).await.unwrap();
        assert_eq!(report, CompactionReport::default());
        assert_eq!(std::fs::read_dir(&directory).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn single_file_buckets_rename_in_place() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        let year = Utc::now().year() - 1;
        let day: FileId = format!("trades:kraken-rest:kraken:btc/eur:{year}-06-03")
            .parse()
            .unwrap();
        store(&repository, &day, &[1, 2, 3]).await;
        let directory = repository.path_of(&day).parent().unwrap().to_path_buf();

        let report = compactor.index_directory(&directory).await.unwrap();
        assert_eq!(report.renamed, 1);
        assert_eq!(report.merged, 0);

        let coarse = day.with_time(TimeKey::Year(year));
        assert_eq!(repository.get(&coarse).await.unwrap().num_rows(), 3);
        assert!(matches!(
            repository.get(&day).await,
            Err(RepositoryError::NotFound(_))
        ));

        // the renamed file is terminal for its tier
        let report = compactor.index_directory(&directory).await.unwrap();
        assert_eq!(report, CompactionReport::default());
    }

    #[tokio::test]
    async fn todays_files_stay_untouched() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        let point = id("trades:kraken-rest:kraken:btc/eur:2021-03-15T10:00:00.000000000Z");
        let nanos = at("2021-03-15T10:00:00Z").timestamp_nanos_opt().unwrap();
        store(&repository, &point, &[nanos]).await;
        let directory = repository.path_of(&point).parent().unwrap().to_path_buf();

        let report = compactor
            .index_directory_as_of(&directory, at("2021-03-15T12:00:00Z"))
            .await
            .unwrap();
        assert_eq!(report, CompactionReport::default());
        assert_eq!(repository.get(&point).await.unwrap().num_rows(), 1);
    }

    #[tokio::test]
    async fn boundary_points_are_coarsened_never_removed() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        // the first trades of March land at exactly the moment February's
        // settled claim ends; nothing has absorbed those rows yet
        let month = id("trades:kraken-rest:kraken:btc/eur:2021-02");
        let point = id("trades:kraken-rest:kraken:btc/eur:2021-03-01T00:00:00.000000000Z");
        let midnight = at("2021-03-01T00:00:00Z").timestamp_nanos_opt().unwrap();
        store(&repository, &month, &[midnight - 500, midnight - 100]).await;
        store(&repository, &point, &[midnight, midnight + 1, midnight + 2]).await;
        age_file(&repository, &month, 600);
        let directory = repository.path_of(&month).parent().unwrap().to_path_buf();

        let report = compactor
            .index_directory_as_of(&directory, at("2021-03-15T12:00:00Z"))
            .await
            .unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(report.renamed, 1);

        let day = point.with_time(TimeKey::Day(2021, 3, 1));
        assert_eq!(repository.get(&day).await.unwrap().num_rows(), 3);

        // the coarsened pair is terminal for this clock
        let report = compactor
            .index_directory_as_of(&directory, at("2021-03-15T12:00:00Z"))
            .await
            .unwrap();
        assert_eq!(report, CompactionReport::default());
    }

    #[tokio::test]
    async fn containment_gate_spares_boundary_points() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        let shadow = id("trades:kraken-rest:kraken:btc/eur:2020-03");
        let boundary = id("trades:kraken-rest:kraken:btc/eur:2020-04-01T00:00:00.000000000Z");
        store(&repository, &shadow, &[1]).await;
        store(&repository, &boundary, &[2]).await;
        age_file(&repository, &shadow, 600);

        // a hand-built plan mis-attributing the next period's first point
        let mut bogus = Plan::default();
        bogus
            .to_remove
            .insert(shadow.clone(), vec![boundary.clone()]);
        let mut report = CompactionReport::default();
        compactor
            .apply_removals(&bogus, Utc::now(), &mut report)
            .await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.removed, 0);
        assert!(repository.get(&boundary).await.is_ok());
    }

    #[tokio::test]
    async fn containment_gate_refuses_foreign_claims() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        let shadow = id("trades:kraken-rest:kraken:btc/eur:2020-03-04");
        let outside = id("trades:kraken-rest:kraken:btc/eur:2020-03-05");
        store(&repository, &shadow, &[1]).await;
        store(&repository, &outside, &[2]).await;
        age_file(&repository, &shadow, 600);

        // a hand-built plan mis-attributing a neighbouring day
        let mut bogus = Plan::default();
        bogus
            .to_remove
            .insert(shadow.clone(), vec![outside.clone()]);
        let mut report = CompactionReport::default();
        compactor
            .apply_removals(&bogus, Utc::now(), &mut report)
            .await;

        assert_eq!(report.skipped, 1);
        assert_eq!(report.removed, 0);
        assert_eq!(repository.get(&outside).await.unwrap().num_rows(), 1);
    }

    #[tokio::test]
    async fn missing_shadow_skips_its_whole_group() {
        let root = TempDir::new().unwrap();
        let repository = LocalRepository::new(Arc::new(StoreOption::from(root.path())));
        let compactor = Compactor::new(repository.clone());

        let shadow = id("trades:kraken-rest:kraken:btc/eur:2020-03");
        let candidate = id("trades:kraken-rest:kraken:btc/eur:2020-03-04");
        store(&repository, &candidate, &[1]).await;

        let mut orphaned = Plan::default();
        orphaned
            .to_remove
            .insert(shadow, vec![candidate.clone()]);
        let mut report = CompactionReport::default();
        compactor
            .apply_removals(&orphaned, Utc::now(), &mut report)
            .await;

        assert_eq!(report.skipped, 1);
        assert!(repository.get(&candidate).await.is_ok());
    }
}
