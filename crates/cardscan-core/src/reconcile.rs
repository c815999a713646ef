//! Reconciliation of the model against live storage.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{MediaSource, ScanMode};
use crate::error::{CardScanError, Result};
use crate::filter;
use crate::media::{FileRecord, FileRef, MediaFile};
use crate::pipeline::Origin;
use crate::scanner::Inner;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// Only on storage.
    Insert(MediaFile),
    /// Only in the model.
    Delete(String),
    /// On both sides but size or date changed.
    Replace(MediaFile),
    /// Unchanged.
    Keep(String),
}

/// Merge-joins the model's records of a kind against a storage listing. Both
/// inputs must be sorted by name with no repeated names.
pub fn merge_join(known: &[FileRecord], found: &[MediaFile]) -> Result<Vec<Reconcile>> {
    ensure_unique("model", known.iter().map(|record| record.name.as_str()))?;
    ensure_unique("storage", found.iter().map(|file| file.name.as_str()))?;

    let mut plan = Vec::with_capacity(known.len().max(found.len()));
    let (mut k, mut f) = (0, 0);
    loop {
        match (known.get(k), found.get(f)) {
            (None, None) => break,
            (None, Some(file)) => {
                plan.push(Reconcile::Insert(file.clone()));
                f += 1;
            }
            (Some(record), None) => {
                plan.push(Reconcile::Delete(record.name.clone()));
                k += 1;
            }
            (Some(record), Some(file)) => match record.name.cmp(&file.name) {
                Ordering::Equal => {
                    if record.matches(file) {
                        plan.push(Reconcile::Keep(record.name.clone()));
                    } else {
                        plan.push(Reconcile::Replace(file.clone()));
                    }
                    k += 1;
                    f += 1;
                }
                Ordering::Greater => {
                    plan.push(Reconcile::Insert(file.clone()));
                    f += 1;
                }
                Ordering::Less => {
                    plan.push(Reconcile::Delete(record.name.clone()));
                    k += 1;
                }
            },
        }
    }
    Ok(plan)
}

fn ensure_unique<'a>(side: &str, names: impl Iterator<Item = &'a str>) -> Result<()> {
    let mut previous: Option<&str> = None;
    for name in names {
        match previous.map(|previous| previous.cmp(name)) {
            None | Some(Ordering::Less) => {}
            Some(Ordering::Equal) => {
                return Err(CardScanError::Invariant(format!("{side} lists {name} twice")));
            }
            Some(Ordering::Greater) => {
                return Err(CardScanError::Invariant(format!(
                    "{side} listing not sorted at {name}"
                )));
            }
        }
        previous = Some(name);
    }
    Ok(())
}

/// One kind's share of a scan. Stops early once `generation` is superseded.
pub(crate) async fn sub_scan(
    inner: Arc<Inner>,
    idx: usize,
    mode: ScanMode,
    since: Option<i64>,
    generation: u64,
) {
    let source = &inner.sources[idx];
    match mode {
        ScanMode::Incremental => {
            if quick_phase(&inner, source, since, generation).await {
                verify_phase(&inner, source, generation).await;
            }
        }
        ScanMode::Full => full_scan(&inner, source, generation).await,
    }
    inner.end_scan(generation).await;
}

/// Feeds files newer than `since` to the pipeline. Returns false if the
/// sub-scan should stop.
async fn quick_phase(inner: &Inner, source: &MediaSource, since: Option<i64>, generation: u64) -> bool {
    let mut cursor = match source
        .storage
        .enumerate(source.config.directory(), since)
        .await
    {
        Ok(cursor) => cursor,
        Err(err) => {
            warn!("cannot enumerate {}: {}", source.kind, err);
            return false;
        }
    };

    let mut found = 0usize;
    while let Some(item) = cursor.next().await {
        if inner.generation() != generation {
            debug!("{} scan superseded during quick phase", source.kind);
            return false;
        }
        match item {
            Ok(file) if filter::accepts(&source.config, &file) => {
                found += 1;
                inner
                    .pipeline
                    .insert(source.kind.clone(), FileRef::Known(file), Origin::Scan)
                    .await;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("enumeration of {} failed: {}", source.kind, err);
                return false;
            }
        }
    }
    debug!("{} quick phase found {} candidates", source.kind, found);
    true
}

/// Checks the remaining unverified records of the kind one at a time, in
/// list order.
async fn verify_phase(inner: &Inner, source: &MediaSource, generation: u64) {
    let pending = inner.model.lock().unverified_names(&source.kind);
    if pending.is_empty() {
        return;
    }
    debug!("verifying {} {} records", pending.len(), source.kind);

    for name in pending {
        if inner.generation() != generation {
            debug!("{} scan superseded during verify phase", source.kind);
            return;
        }
        let recorded = inner
            .model
            .lock()
            .get(&name)
            .filter(|record| record.unverified)
            .cloned();
        let Some(record) = recorded else {
            continue;
        };

        match source.storage.get(&name).await {
            Ok(file) if record.matches(&file) => {
                inner.model.lock().set_verified(&name);
            }
            Ok(file) => {
                debug!("{} changed on storage", name);
                inner.pipeline.delete(name, Origin::Scan).await;
                inner
                    .pipeline
                    .insert(source.kind.clone(), FileRef::Known(file), Origin::Scan)
                    .await;
            }
            Err(err) if err.is_not_found() => {
                inner.pipeline.delete(name, Origin::Scan).await;
            }
            Err(err) => {
                warn!("cannot verify {}, keeping it: {}", name, err);
            }
        }
    }
}

async fn full_scan(inner: &Inner, source: &MediaSource, generation: u64) {
    let mut cursor = match source.storage.enumerate(source.config.directory(), None).await {
        Ok(cursor) => cursor,
        Err(err) => {
            warn!("cannot enumerate {}: {}", source.kind, err);
            return;
        }
    };
    let mut found = Vec::new();
    while let Some(item) = cursor.next().await {
        match item {
            Ok(file) if filter::accepts(&source.config, &file) => found.push(file),
            Ok(_) => {}
            Err(err) => {
                warn!("enumeration of {} failed: {}", source.kind, err);
                return;
            }
        }
    }
    found.sort_by(|a, b| a.name.cmp(&b.name));

    let known = inner.model.lock().files_of_kind(&source.kind);
    let plan = match merge_join(&known, &found) {
        Ok(plan) => plan,
        Err(err) => {
            error!("full scan of {} aborted: {}", source.kind, err);
            return;
        }
    };
    info!(
        "full scan of {}: {} on storage, {} known",
        source.kind,
        found.len(),
        known.len()
    );

    for action in plan {
        if inner.generation() != generation {
            debug!("{} full scan superseded", source.kind);
            return;
        }
        match action {
            Reconcile::Keep(name) => {
                inner.model.lock().set_verified(&name);
            }
            Reconcile::Insert(file) => {
                inner
                    .pipeline
                    .insert(source.kind.clone(), FileRef::Known(file), Origin::Scan)
                    .await;
            }
            Reconcile::Delete(name) => {
                inner.pipeline.delete(name, Origin::Scan).await;
            }
            Reconcile::Replace(file) => {
                inner.pipeline.delete(file.name.clone(), Origin::Scan).await;
                inner
                    .pipeline
                    .insert(source.kind.clone(), FileRef::Known(file), Origin::Scan)
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaMetadata;

    fn file(name: &str, size: u64, date: i64) -> MediaFile {
        MediaFile::new(name, "image/jpeg", size, date)
    }

    fn record(name: &str, size: u64, date: i64) -> FileRecord {
        FileRecord::new("pictures".into(), file(name, size, date), MediaMetadata::default())
    }

    #[test]
    fn merge_join_covers_every_case() {
        let known = vec![
            record("a.jpg", 1, 10),
            record("c.jpg", 1, 30),
            record("d.jpg", 1, 40),
            record("f.jpg", 1, 60),
        ];
        let found = vec![
            file("b.jpg", 1, 20),
            file("c.jpg", 1, 30),
            file("d.jpg", 2, 40),
            file("e.jpg", 1, 50),
        ];
        let plan = merge_join(&known, &found).unwrap();
        assert_eq!(
            plan,
            vec![
                Reconcile::Delete("a.jpg".into()),
                Reconcile::Insert(file("b.jpg", 1, 20)),
                Reconcile::Keep("c.jpg".into()),
                Reconcile::Replace(file("d.jpg", 2, 40)),
                Reconcile::Insert(file("e.jpg", 1, 50)),
                Reconcile::Delete("f.jpg".into()),
            ]
        );
    }

    #[test]
    fn merge_join_of_empty_sides() {
        assert!(merge_join(&[], &[]).unwrap().is_empty());
        assert_eq!(
            merge_join(&[], &[file("a", 1, 1)]).unwrap(),
            vec![Reconcile::Insert(file("a", 1, 1))]
        );
        assert_eq!(
            merge_join(&[record("a", 1, 1)], &[]).unwrap(),
            vec![Reconcile::Delete("a".into())]
        );
    }

    #[test]
    fn duplicate_names_violate_invariant() {
        let dup = vec![record("a", 1, 1), record("a", 2, 2)];
        assert!(matches!(
            merge_join(&dup, &[]),
            Err(CardScanError::Invariant(_))
        ));
        let dup = vec![file("a", 1, 1), file("a", 2, 2)];
        assert!(matches!(
            merge_join(&[], &dup),
            Err(CardScanError::Invariant(_))
        ));
        let unsorted = vec![file("b", 1, 1), file("a", 1, 1)];
        assert!(matches!(
            merge_join(&[], &unsorted),
            Err(CardScanError::Invariant(_))
        ));
    }
}
