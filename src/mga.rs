//! AssistNow Offline (MGA-ANO) upload.

use std::{
    io::{Read, Write},
    path::Path,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use hifitime::prelude::Epoch;
use log::{debug, info, trace, warn};
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

use crate::{
    device::open_reader,
    error::{Error, UploadPhase},
    registry::Handler,
    ubx::{Decoder, Error as UbxError, Message, MgaAck, MgaAno},
};

/// Acknowledgments waiting to be counted
const ACK_CHANNEL_SIZE: usize = 128;

#[derive(Debug, Copy, Clone)]
pub struct Settings {
    /// Dead time after each record
    pub pacing: Duration,
    /// Dead time after the last record, to collect pending acknowledgments
    pub drain: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pacing: Duration::from_millis(10),
            drain: Duration::from_secs(2),
        }
    }
}

/// Upload summary
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub sent: usize,
    pub skipped: usize,
    pub acknowledged: usize,
    pub rejected: usize,
}

impl std::fmt::Display for UploadReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "sent {} messages ({} skipped) and received {} acks ({} rejected)",
            self.sent, self.skipped, self.acknowledged, self.rejected
        )
    }
}

/// [Handler] forwarding MGA-ACK-DATA0 to the pending upload
pub struct AckForwarder {
    tx: mpsc::Sender<MgaAck>,
}

impl Handler for AckForwarder {
    fn handle(&mut self, msg: &Message) -> Result<(), Error> {
        if let Message::MgaAck(ack) = msg {
            match self.tx.try_send(ack.clone()) {
                Ok(_) => {},
                Err(TrySendError::Full(_)) => {
                    warn!(target: "mga", "ack channel full: dropping acknowledgment");
                },
                Err(TrySendError::Closed(_)) => {
                    trace!(target: "mga", "no upload pending: ignoring acknowledgment");
                },
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct AckCounters {
    acknowledged: AtomicUsize,
    rejected: AtomicUsize,
}

/// Ack listener task, aborted whenever the upload returns
struct Listener(JoinHandle<()>);

impl Drop for Listener {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// One-shot MGA-ANO uploader
pub struct AnoUploader {
    settings: Settings,
    acks: mpsc::Receiver<MgaAck>,
}

/// True when the record date (UTC midnight) matches the reference day.
pub fn record_matches(ano: &MgaAno, reference: Epoch) -> Result<bool, Error> {
    let date = Epoch::maybe_from_gregorian_utc(
        ano.year as i32 + 2000,
        ano.month,
        ano.day,
        0,
        0,
        0,
        0,
    )
    .map_err(|_| Error::InvalidRecordDate {
        year: ano.year,
        month: ano.month,
        day: ano.day,
    })?;

    let (y, m, d, _, _, _, _) = date.to_gregorian_utc();
    let (ref_y, ref_m, ref_d, _, _, _, _) = reference.to_gregorian_utc();
    Ok((y, m, d) == (ref_y, ref_m, ref_d))
}

/// Record loop. Reads, writes and pacing all block, so this runs on a blocking thread.
fn send_records<R: Read, W: Write>(
    source: R,
    upload_all: bool,
    reference_date: Epoch,
    transport: &mut W,
    pacing: Duration,
) -> Result<UploadReport, Error> {
    let mut report = UploadReport::default();
    let mut decoder = Decoder::new(source);

    loop {
        let ano = match decoder.decode() {
            Ok(Message::MgaAno(ano)) => ano,
            Ok(msg) => {
                warn!(target: "mga", "unexpected {:?} message in offline file", msg.kind());
                continue;
            },
            Err(UbxError::EndOfStream) => {
                debug!(target: "mga", "reached mga EOF");
                return Ok(report);
            },
            Err(e) => return Err(Error::from(e).during(UploadPhase::Decode)),
        };

        let selected = upload_all
            || record_matches(&ano, reference_date).map_err(|e| e.during(UploadPhase::Decode))?;

        if !selected {
            report.skipped += 1;
            continue;
        }

        let encoded = ano
            .encode()
            .map_err(|e| Error::from(e).during(UploadPhase::Encode))?;

        transport
            .write_all(&encoded)
            .and_then(|_| transport.flush())
            .map_err(|e| Error::Io(e).during(UploadPhase::Write))?;

        report.sent += 1;
        trace!(
            target: "mga",
            "sent ano record sv={} gnss={} (20{:02}-{:02}-{:02})",
            ano.sv_id,
            ano.gnss_id,
            ano.year,
            ano.month,
            ano.day
        );

        std::thread::sleep(pacing);
    }
}

impl AnoUploader {
    /// Builds the uploader and the [AckForwarder] to register for
    /// [crate::ubx::MessageKind::MgaAck].
    pub fn new(settings: Settings) -> (Self, AckForwarder) {
        let (tx, acks) = mpsc::channel(ACK_CHANNEL_SIZE);
        (Self { settings, acks }, AckForwarder { tx })
    }

    /// Uploads the AssistNow Offline file to the receiver.
    /// Only records for the `reference_date` day are sent, unless `upload_all`.
    pub async fn load_and_upload<P: AsRef<Path>, W: Write + Send + 'static>(
        self,
        path: P,
        upload_all: bool,
        reference_date: Epoch,
        transport: W,
    ) -> Result<UploadReport, Error> {
        let path = path.as_ref();
        info!(target: "mga", "loading mga offline file: {}", path.display());

        let reader = open_reader(path).map_err(|e| Error::Io(e).during(UploadPhase::Open))?;

        self.upload(reader, upload_all, reference_date, transport)
            .await
    }

    /// Uploads every (selected) record [Read] from `source`.
    pub async fn upload<R, W>(
        self,
        source: R,
        upload_all: bool,
        reference_date: Epoch,
        mut transport: W,
    ) -> Result<UploadReport, Error>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let Self { settings, mut acks } = self;

        let counters = Arc::new(AckCounters::default());

        let _listener = Listener(tokio::spawn({
            let counters = counters.clone();
            async move {
                while let Some(ack) = acks.recv().await {
                    if ack.accepted() {
                        trace!(target: "mga", "ack for {:02x}", ack.msg_id);
                    } else {
                        counters.rejected.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            target: "mga",
                            "record not used by receiver (info code {})",
                            ack.info_code
                        );
                    }
                    counters.acknowledged.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));

        let mut report = tokio::task::spawn_blocking(move || {
            send_records(
                source,
                upload_all,
                reference_date,
                &mut transport,
                settings.pacing,
            )
        })
        .await
        .map_err(|_| Error::TaskAborted("upload"))??;

        tokio::time::sleep(settings.drain).await;

        report.acknowledged = counters.acknowledged.load(Ordering::Relaxed);
        report.rejected = counters.rejected.load(Ordering::Relaxed);

        info!(target: "mga", "{}", report);
        Ok(report)
    }
}
