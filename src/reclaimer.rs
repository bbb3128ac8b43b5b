use crate::db::SweepCursor;
use crate::lifecycle::Lifecycle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Rows fetched per query while sweeping.
const PAGE_SIZE: u32 = 256;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reclaimed: usize,
    pub failed: usize,
}

/// Deletes every entry that expired at or before the lifecycle's current time.
///
/// A failure on one id is logged and the sweep moves on; the next tick retries it.
pub async fn sweep(lifecycle: &Lifecycle) -> SweepReport {
    let cutoff = lifecycle.now();
    let mut report = SweepReport::default();
    let mut cursor: Option<SweepCursor> = None;
    loop {
        let page = match lifecycle
            .db()
            .list_expired_before(cutoff, cursor.as_ref(), PAGE_SIZE)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                log::error!("expired listing failed: {e}");
                report.failed += 1;
                break;
            }
        };
        for id in &page.ids {
            match lifecycle.delete(id).await {
                Ok(()) => report.reclaimed += 1,
                Err(e) => {
                    log::warn!("could not reclaim {id}: {e}");
                    report.failed += 1;
                }
            }
        }
        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    report
}

/// Background sweeper. Dropping the handle stops the task at its next wake-up.
pub struct Reclaimer {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Reclaimer {
    pub fn start(lifecycle: Arc<Lifecycle>, every: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        log::info!("reclaimer running every {:?}", every);
        let task = actix_web::rt::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stopped.changed() => break,
                }
                let report = sweep(&lifecycle).await;
                if report.reclaimed > 0 || report.failed > 0 {
                    log::info!(
                        "sweep reclaimed {} expired files, {} failures",
                        report.reclaimed,
                        report.failed
                    );
                }
            }
            log::info!("reclaimer stopped");
        });
        Self { stop, task }
    }

    /// Signals the task and waits for it. A sweep in progress finishes first.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            log::error!("reclaimer task ended abnormally: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobs::BlobStore;
    use crate::clock::ManualClock;
    use crate::db::Db;
    use crate::ids::OsIdGenerator;
    use chrono::{TimeZone, Utc};
    use futures_util::stream;
    use tempfile::TempDir;

    async fn lifecycle(dir: &TempDir, clock: Arc<ManualClock>) -> Lifecycle {
        let db_path = dir.path().join("meta.sqlite3");
        let db = Db::connect_and_migrate(db_path.to_str().unwrap(), 4).await.unwrap();
        let blobs = BlobStore::new(dir.path().join("uploads"), 1024).await.unwrap();
        Lifecycle::new(
            db,
            blobs,
            Arc::new(OsIdGenerator),
            clock,
            chrono::Duration::days(7),
            "http://localhost",
        )
    }

    async fn put(lc: &Lifecycle, content: &'static [u8]) -> String {
        let body = stream::iter(vec![Ok::<_, String>(content)]);
        lc.upload("f.txt", body).await.unwrap().id
    }

    #[actix_web::test]
    async fn sweep_removes_expired_rows_and_blobs_only() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let lc = lifecycle(&dir, clock.clone()).await;

        let mut old = Vec::new();
        for _ in 0..300 {
            old.push(put(&lc, b"old").await);
        }
        clock.advance(chrono::Duration::days(3));
        let fresh = put(&lc, b"fresh").await;
        clock.advance(chrono::Duration::days(5));

        let report = sweep(&lc).await;
        assert_eq!(report, SweepReport { reclaimed: 300, failed: 0 });
        for id in &old {
            assert!(!lc.db().exists(id).await.unwrap());
            assert!(!dir.path().join("uploads").join(id).exists());
        }
        assert!(lc.db().exists(&fresh).await.unwrap());
        assert!(dir.path().join("uploads").join(&fresh).exists());

        let page = lc.db().list_expired_before(lc.now(), None, 10).await.unwrap();
        assert!(page.ids.is_empty());
    }

    #[actix_web::test]
    async fn sweep_tolerates_half_deleted_entries() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let lc = lifecycle(&dir, clock.clone()).await;

        let no_blob = put(&lc, b"a").await;
        std::fs::remove_file(dir.path().join("uploads").join(&no_blob)).unwrap();
        clock.advance(chrono::Duration::days(8));

        let report = sweep(&lc).await;
        assert_eq!(report, SweepReport { reclaimed: 1, failed: 0 });
        assert!(!lc.db().exists(&no_blob).await.unwrap());
    }

    #[actix_web::test]
    async fn one_failed_delete_does_not_stop_the_sweep() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let lc = lifecycle(&dir, clock.clone()).await;

        let ids = vec![put(&lc, b"a").await, put(&lc, b"b").await, put(&lc, b"c").await];
        let stuck = dir.path().join("uploads").join(&ids[1]);
        std::fs::remove_file(&stuck).unwrap();
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("inner"), b"x").unwrap();
        clock.advance(chrono::Duration::days(8));

        let report = sweep(&lc).await;
        assert_eq!(report, SweepReport { reclaimed: 2, failed: 1 });
        assert!(!lc.db().exists(&ids[0]).await.unwrap());
        assert!(lc.db().exists(&ids[1]).await.unwrap());
        assert!(!lc.db().exists(&ids[2]).await.unwrap());
    }

    #[actix_web::test]
    async fn sweep_on_empty_store_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let lc = lifecycle(&dir, clock).await;

        assert_eq!(sweep(&lc).await, SweepReport::default());
    }

    #[actix_web::test]
    async fn background_task_sweeps_and_stops() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let lc = Arc::new(lifecycle(&dir, clock.clone()).await);
        let id = put(&lc, b"bye").await;
        clock.advance(chrono::Duration::days(7));

        let reclaimer = Reclaimer::start(lc.clone(), Duration::from_millis(20));
        let mut gone = false;
        for _ in 0..100 {
            if !lc.db().exists(&id).await.unwrap() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        reclaimer.shutdown().await;

        assert!(gone, "reclaimer never removed {id}");
        assert!(!dir.path().join("uploads").join(&id).exists());
    }
}
