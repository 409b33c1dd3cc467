use std::sync::{Arc, Mutex};

use hifitime::prelude::{Duration, Epoch};
use log::{debug, info};
use rusqlite::{Connection, params};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    error::Error,
    logger::{FixSnapshot, sink::Sink, utc_string},
};

const CREATE: &str = "
CREATE TABLE IF NOT EXISTS gnss (
    id INTEGER NOT NULL PRIMARY KEY,
    time TEXT,
    system_time TEXT,
    fix TEXT NOT NULL,
    eph REAL NOT NULL,
    sep REAL NOT NULL,
    latitude REAL NOT NULL,
    longitude REAL NOT NULL,
    altitude REAL NOT NULL,
    heading REAL NOT NULL,
    speed REAL NOT NULL,
    gdop REAL NOT NULL,
    hdop REAL NOT NULL,
    pdop REAL NOT NULL,
    tdop REAL NOT NULL,
    vdop REAL NOT NULL,
    xdop REAL NOT NULL,
    ydop REAL NOT NULL,
    seen INTEGER NOT NULL,
    used INTEGER NOT NULL
);";

const INSERT: &str = "
INSERT INTO gnss VALUES(NULL,?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19);";

// rows without any time reference cannot age, they go on the next purge
const PURGE: &str = "DELETE FROM gnss WHERE COALESCE(time, system_time, '') < ?1;";

type Handle = Arc<Mutex<Option<Connection>>>;

fn with_db<T>(db: &Handle, f: impl FnOnce(&Connection) -> Result<T, Error>) -> Result<T, Error> {
    let guard = db.lock().map_err(|_| Error::LockPoisoned)?;
    let conn = guard.as_ref().ok_or(Error::SinkNotInitialized)?;
    f(conn)
}

fn purge_older_than(db: &Handle, cutoff: Epoch) -> Result<usize, Error> {
    with_db(db, |conn| {
        debug!(target: "sqlite", "purging rows older than {}", cutoff);
        Ok(conn.execute(PURGE, params![utc_string(cutoff)])?)
    })
}

async fn purge_periodically(
    db: Handle,
    retention: Duration,
    period: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    loop {
        let cutoff = Epoch::now()? - retention;
        let purged = purge_older_than(&db, cutoff)?;
        info!(target: "sqlite", "purged {} rows", purged);

        tokio::select! {
            _ = tokio::time::sleep(period) => {},
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            },
        }
    }
}

/// SQLite [Sink], one row per snapshot in table `gnss`.
/// The connection is shared with the optional purge task.
#[derive(Clone)]
pub struct SqliteSink {
    path: String,
    db: Handle,
}

impl SqliteSink {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            db: Arc::new(Mutex::new(None)),
        }
    }

    /// Opens the database and creates the table if needed
    pub fn init(&mut self) -> Result<(), Error> {
        let conn = Connection::open(&self.path)?;
        conn.execute_batch(CREATE)?;

        let mut guard = self.db.lock().map_err(|_| Error::LockPoisoned)?;
        *guard = Some(conn);

        info!(target: "sqlite", "database \"{}\" initialized", self.path);
        Ok(())
    }

    /// Deletes rows whose receiver time is older than `cutoff`
    pub fn purge_older_than(&self, cutoff: Epoch) -> Result<usize, Error> {
        purge_older_than(&self.db, cutoff)
    }

    /// Deletes rows older than now minus `retention`
    pub fn purge(&self, retention: Duration) -> Result<usize, Error> {
        let cutoff = Epoch::now()? - retention;
        self.purge_older_than(cutoff)
    }

    /// Deploys the retention task: purges once every `period`, until shutdown.
    pub fn spawn_purge(
        &self,
        retention: Duration,
        period: std::time::Duration,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<Result<(), Error>> {
        info!(
            target: "sqlite",
            "will purge rows older than {} every {:?}",
            retention,
            period
        );
        tokio::spawn(purge_periodically(
            self.db.clone(),
            retention,
            period,
            shutdown,
        ))
    }

    #[cfg(test)]
    fn count(&self) -> Result<usize, Error> {
        with_db(&self.db, |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM gnss", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}

impl Sink for SqliteSink {
    fn persist(&mut self, snapshot: FixSnapshot) -> Result<(), Error> {
        with_db(&self.db, |conn| {
            conn.execute(
                INSERT,
                params![
                    snapshot.timestamp.map(utc_string),
                    snapshot.system_time.map(utc_string),
                    snapshot.fix.to_string(),
                    snapshot.eph,
                    snapshot.sep,
                    snapshot.latitude,
                    snapshot.longitude,
                    snapshot.altitude,
                    snapshot.heading,
                    snapshot.speed,
                    snapshot.dop.gdop,
                    snapshot.dop.hdop,
                    snapshot.dop.pdop,
                    snapshot.dop.tdop,
                    snapshot.dop.vdop,
                    snapshot.dop.xdop,
                    snapshot.dop.ydop,
                    snapshot.satellites.seen as i64,
                    snapshot.satellites.used as i64,
                ],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod test {
    use super::SqliteSink;
    use crate::{
        error::Error,
        logger::{FixQuality, FixSnapshot, sink::Sink},
    };
    use hifitime::prelude::{Duration, Epoch};
    use std::str::FromStr;
    use tokio::sync::watch;

    fn snapshot(t: &str) -> FixSnapshot {
        FixSnapshot {
            fix: FixQuality::Fix3D,
            timestamp: Some(Epoch::from_str(t).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_not_initialized() {
        let mut sink = SqliteSink::new(":memory:");

        assert!(matches!(
            sink.persist(FixSnapshot::default()),
            Err(Error::SinkNotInitialized)
        ));

        assert!(matches!(
            sink.purge(Duration::from_days(1.0)),
            Err(Error::SinkNotInitialized)
        ));
    }

    #[test]
    fn test_persist_and_purge() {
        let mut sink = SqliteSink::new(":memory:");
        sink.init().unwrap();

        sink.persist(snapshot("2020-01-01T00:00:00 UTC")).unwrap();
        sink.persist(snapshot("2020-01-01T00:00:01 UTC")).unwrap();
        sink.persist(snapshot("2024-06-01T12:00:00 UTC")).unwrap();
        assert_eq!(sink.count().unwrap(), 3);

        let cutoff = Epoch::from_str("2023-01-01T00:00:00 UTC").unwrap();
        assert_eq!(sink.purge_older_than(cutoff).unwrap(), 2);
        assert_eq!(sink.count().unwrap(), 1);

        // nothing left to purge
        assert_eq!(sink.purge_older_than(cutoff).unwrap(), 0);
    }

    #[test]
    fn test_row_content() {
        let mut sink = SqliteSink::new(":memory:");
        sink.init().unwrap();

        let mut snapshot = snapshot("2024-06-01T12:00:00 UTC");
        snapshot.satellites.seen = 12;
        snapshot.satellites.used = 7;
        snapshot.latitude = 47.339722;
        sink.persist(snapshot).unwrap();

        let guard = sink.db.lock().unwrap();
        let conn = guard.as_ref().unwrap();
        let (time, fix, latitude, used): (String, String, f64, i64) = conn
            .query_row(
                "SELECT time, fix, latitude, used FROM gnss",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .unwrap();

        assert_eq!(time, "2024-06-01T12:00:00.000000000Z");
        assert_eq!(fix, "3D");
        assert!((latitude - 47.339722).abs() < 1E-12);
        assert_eq!(used, 7);
    }

    #[tokio::test]
    async fn test_purge_task() {
        let mut sink = SqliteSink::new(":memory:");
        sink.init().unwrap();
        sink.persist(snapshot("2020-01-01T00:00:00 UTC")).unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = sink.spawn_purge(
            Duration::from_days(1.0),
            std::time::Duration::from_millis(10),
            shutdown_rx,
        );

        for _ in 0..100 {
            if sink.count().unwrap() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(sink.count().unwrap(), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_purge_task_failure() {
        let sink = SqliteSink::new(":memory:");
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = sink.spawn_purge(
            Duration::from_days(1.0),
            std::time::Duration::from_millis(10),
            shutdown_rx,
        );

        assert!(matches!(
            handle.await.unwrap(),
            Err(Error::SinkNotInitialized)
        ));
    }
}
