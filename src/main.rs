#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

/*
 * UBXLOG is part of the nav-solutions framework.
 * Authors: Guillaume W. Bres <guillaume.bressaix@gmail.com> et al,
 * This framework is shipped under Mozilla Public V2 license.
 */

use env_logger::{Builder, Target};

use log::{debug, error, info};

use tokio::{
    signal,
    sync::{oneshot, watch},
    task::JoinHandle,
};

use hifitime::prelude::Epoch;

use std::fs::File;

mod cli;
mod decoder;
mod device;
mod error;
mod logger;
mod mga;
mod registry;
mod ubx;

use crate::{
    cli::Cli,
    decoder::{DecodeLoop, Termination},
    device::Device,
    error::Error,
    logger::{FixAggregator, sink::JsonSink, sqlite::SqliteSink},
    mga::{AnoUploader, UploadReport},
    registry::HandlerRegistry,
    ubx::MessageKind,
};

async fn run(cli: Cli) -> Result<Termination, Error> {
    let t_start = Epoch::now()?;

    // Input interface
    let mut device = if let Some(serial) = cli.serial_port() {
        // active mode (GNSS module)
        Device::open_serial_port(serial, cli.baud_rate())?
    } else {
        // passive mode (input files)
        Device::open_files(&cli.filepaths())?
    };

    // Device configuration
    if !device.is_read_only() && !cli.no_config() {
        device.enable_messages()?;
    }

    // shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Sinks
    let settings = cli.sink_settings();
    let mut aggregator = FixAggregator::new(t_start);

    let mut purge = None;

    if let Some(path) = &settings.database {
        let mut sqlite = SqliteSink::new(path);
        sqlite.init()?;

        // null retention: keep everything
        if let Some(retention) = settings
            .retention
            .filter(|retention| retention.total_nanoseconds() > 0)
        {
            purge = Some(sqlite.spawn_purge(
                retention,
                settings.purge_period,
                shutdown_rx.clone(),
            ));
        }

        aggregator.add_sink(Box::new(sqlite));
    }

    match settings.json.as_deref() {
        Some("-") => aggregator.add_sink(Box::new(JsonSink::new(std::io::stdout()))),
        Some(path) => aggregator.add_sink(Box::new(JsonSink::new(File::create(path)?))),
        None => {},
    }

    let mut registry = HandlerRegistry::new();

    // AssistNow Offline: the forwarder must be registered before decoding starts
    let assistance = match cli.assistance_settings() {
        Some(assistance) => {
            let (uploader, forwarder) = AnoUploader::new(assistance.upload);
            let id = registry.register(forwarder, &[MessageKind::MgaAck]);
            debug!("ack forwarder registered as {}", id);

            let writer = device.writer()?;
            let date = match assistance.date {
                Some(date) => date,
                None => Epoch::now()?,
            };

            Some((uploader, writer, assistance.path, assistance.upload_all, date))
        },
        None => None,
    };

    aggregator.set_start_time(Epoch::now()?);

    let id = registry.register(
        aggregator,
        &[MessageKind::NavPvt, MessageKind::NavDop, MessageKind::NavSat],
    );
    debug!("fix aggregator registered as {}", id);

    let done = DecodeLoop::new(device.into_decoder(), registry, shutdown_rx).spawn();

    info!("{} - application deployed", t_start);

    let upload = tokio::spawn(async move {
        match assistance {
            Some((uploader, writer, path, upload_all, date)) => uploader
                .load_and_upload(&path, upload_all, date, writer)
                .await
                .map(Some),
            None => Ok::<Option<UploadReport>, Error>(None),
        }
    });

    // no retention: completes right away
    let purge = purge.unwrap_or_else(|| tokio::spawn(async { Ok(()) }));

    supervise(done, upload, purge, &shutdown_tx).await
}

/// Waits for the decode loop to terminate, while monitoring the side tasks.
/// Ctrl-C or a failing side task shut everything down.
async fn supervise(
    mut done: oneshot::Receiver<Result<Termination, Error>>,
    mut upload: JoinHandle<Result<Option<UploadReport>, Error>>,
    mut purge: JoinHandle<Result<(), Error>>,
    shutdown: &watch::Sender<bool>,
) -> Result<Termination, Error> {
    let mut uploading = true;
    let mut purging = true;

    let result = loop {
        tokio::select! {
            result = &mut done => {
                break result.map_err(|_| Error::TaskAborted("decoder"))?;
            },
            interrupt = signal::ctrl_c() => {
                interrupt?;
                info!("shutting down");
                let _ = shutdown.send(true);
                break done.await.map_err(|_| Error::TaskAborted("decoder"))?;
            },
            report = &mut upload, if uploading => {
                uploading = false;
                match report.map_err(|_| Error::TaskAborted("upload"))? {
                    Ok(Some(report)) => debug!("upload completed: {}", report),
                    Ok(None) => {},
                    Err(e) => break Err(e),
                }
            },
            result = &mut purge, if purging => {
                purging = false;
                if let Err(e) = result.map_err(|_| Error::TaskAborted("purge"))? {
                    break Err(e);
                }
            },
        }
    };

    if uploading {
        upload.abort();
    }

    let _ = shutdown.send(true);

    if purging {
        purge.await.map_err(|_| Error::TaskAborted("purge"))??;
    }

    result
}

#[tokio::main]
pub async fn main() {
    let mut builder = Builder::from_default_env();

    builder
        .target(Target::Stdout)
        .format_timestamp_secs()
        .format_module_path(false)
        .init();

    let cli = Cli::new();

    match run(cli).await {
        Ok(termination) => {
            info!("terminated: {:?}", termination);
        },
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        },
    }
}

#[cfg(test)]
mod test {
    use super::supervise;
    use crate::{decoder::Termination, error::Error, logger::sqlite::SqliteSink};
    use hifitime::prelude::Duration;
    use tokio::sync::{oneshot, watch};

    #[tokio::test]
    async fn test_decoder_termination() {
        let (done_tx, done_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        done_tx.send(Ok(Termination::EndOfStream)).unwrap();

        let upload = tokio::spawn(async { Ok(None) });
        let purge = tokio::spawn(async { Ok(()) });

        assert_eq!(
            supervise(done_rx, upload, purge, &shutdown_tx)
                .await
                .unwrap(),
            Termination::EndOfStream
        );
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_purge_failure_is_fatal() {
        // decode loop never completes on its own
        let (_done_tx, done_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let upload = tokio::spawn(async { Ok(None) });

        // database never initialized: first purge fails
        let purge = SqliteSink::new("unused.db").spawn_purge(
            Duration::from_days(1.0),
            std::time::Duration::from_secs(60),
            shutdown_rx.clone(),
        );

        assert!(matches!(
            supervise(done_rx, upload, purge, &shutdown_tx).await,
            Err(Error::SinkNotInitialized)
        ));
        assert!(*shutdown_rx.borrow());
    }

    #[tokio::test]
    async fn test_upload_failure_is_fatal() {
        let (_done_tx, done_rx) = oneshot::channel();
        let (shutdown_tx, _shutdown_rx) = watch::channel(false);

        let upload = tokio::spawn(async { Err(Error::ReadOnlyInterface) });
        let purge = tokio::spawn(async { Ok(()) });

        assert!(matches!(
            supervise(done_rx, upload, purge, &shutdown_tx).await,
            Err(Error::ReadOnlyInterface)
        ));
    }
}
