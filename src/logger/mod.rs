use hifitime::prelude::{Duration, Epoch};
use log::{debug, info, trace};
use serde::{Serialize, Serializer};

pub mod sink;
pub mod sqlite;

use sink::Sink;

use crate::{
    error::Error,
    registry::Handler,
    ubx::{Message, NavDop, NavPvt, NavSat},
};

/// DOP value used until the receiver reports one
pub const DEFAULT_DOP: f64 = 99.99;

/// Fix is only considered "first fix" with HDOP below this value
pub const TTFF_MAX_HDOP: f64 = 5.0;

/// Formats [Epoch] as fixed width UTC, which sorts lexicographically.
pub fn utc_string(t: Epoch) -> String {
    let (y, m, d, hh, mm, ss, ns) = t.to_gregorian_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:09}Z",
        y, m, d, hh, mm, ss, ns
    )
}

fn serialize_epoch<S: Serializer>(t: &Option<Epoch>, s: S) -> Result<S::Ok, S::Error> {
    match t {
        Some(t) => s.serialize_some(&utc_string(*t)),
        None => s.serialize_none(),
    }
}

fn serialize_ttff<S: Serializer>(ttff: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
    match ttff {
        Some(dt) => s.serialize_some(&((dt.total_nanoseconds() / 1_000_000) as i64)),
        None => s.serialize_none(),
    }
}

/// GNSS fix type, as reported in NAV-PVT
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub enum FixQuality {
    #[default]
    None,
    DeadReckoning,
    Fix2D,
    Fix3D,
    GnssDeadReckoning,
    TimeOnly,
}

impl TryFrom<u8> for FixQuality {
    type Error = Error;

    fn try_from(fix_type: u8) -> Result<Self, Error> {
        match fix_type {
            0 => Ok(Self::None),
            1 => Ok(Self::DeadReckoning),
            2 => Ok(Self::Fix2D),
            3 => Ok(Self::Fix3D),
            4 => Ok(Self::GnssDeadReckoning),
            5 => Ok(Self::TimeOnly),
            code => Err(Error::InvalidFixType(code)),
        }
    }
}

impl std::fmt::Display for FixQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::DeadReckoning => write!(f, "dead reckoning only"),
            Self::Fix2D => write!(f, "2D"),
            Self::Fix3D => write!(f, "3D"),
            Self::GnssDeadReckoning => write!(f, "GNSS + dead reckoning combined"),
            Self::TimeOnly => write!(f, "time only fix"),
        }
    }
}

impl Serialize for FixQuality {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

/// Dilution of precision
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct Dop {
    pub gdop: f64,
    pub hdop: f64,
    pub pdop: f64,
    pub tdop: f64,
    pub vdop: f64,
    /// east-west
    pub xdop: f64,
    /// north-south
    pub ydop: f64,
}

impl Default for Dop {
    fn default() -> Self {
        Self {
            gdop: DEFAULT_DOP,
            hdop: DEFAULT_DOP,
            pdop: DEFAULT_DOP,
            tdop: DEFAULT_DOP,
            vdop: DEFAULT_DOP,
            xdop: DEFAULT_DOP,
            ydop: DEFAULT_DOP,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Serialize)]
pub struct Satellites {
    pub seen: usize,
    pub used: usize,
}

/// One self-consistent view of the receiver state.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FixSnapshot {
    /// Time to first fix, latched once
    #[serde(serialize_with = "serialize_ttff")]
    pub ttff: Option<Duration>,

    /// System time of the latest NAV-PVT
    #[serde(rename = "systemtime", serialize_with = "serialize_epoch")]
    pub system_time: Option<Epoch>,

    /// Receiver UTC time, when valid
    #[serde(serialize_with = "serialize_epoch")]
    pub timestamp: Option<Epoch>,

    pub fix: FixQuality,

    /// Decimal degrees
    pub latitude: f64,

    /// Decimal degrees
    pub longitude: f64,

    /// Meters: ellipsoidal on 3D fixes, above mean sea level otherwise
    #[serde(rename = "height")]
    pub altitude: f64,

    /// Heading of motion (degrees)
    pub heading: f64,

    /// Ground speed (m/s)
    pub speed: f64,

    pub dop: Dop,

    pub satellites: Satellites,

    /// Estimated spherical (3D) position error in meters, certainty unknown
    pub sep: f64,

    /// Estimated horizontal position error in meters, certainty unknown
    pub eph: f64,

    /// Estimated vertical position error in meters, certainty unknown
    pub epv: f64,
}

/// Folds NAV-PVT, NAV-DOP and NAV-SAT reports into a [FixSnapshot],
/// published to all [Sink]s on each NAV-DOP.
pub struct FixAggregator {
    /// Session start, reference for time to first fix
    start: Epoch,

    /// Live state
    snapshot: FixSnapshot,

    sinks: Vec<Box<dyn Sink>>,
}

impl FixAggregator {
    pub fn new(start: Epoch) -> Self {
        Self {
            start,
            snapshot: FixSnapshot::default(),
            sinks: Vec::new(),
        }
    }

    /// Adds a new [Sink], sinks are published to in order of addition
    #[cfg(test)]
    pub fn with_sink<S: Sink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn add_sink(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub fn set_start_time(&mut self, start: Epoch) {
        self.start = start;
    }

    /// Current (live) state
    #[cfg(test)]
    pub fn snapshot(&self) -> &FixSnapshot {
        &self.snapshot
    }

    fn update_position(&mut self, pvt: &NavPvt, now: Epoch) -> Result<(), Error> {
        let fix = FixQuality::try_from(pvt.fix_type)?;

        self.snapshot.system_time = Some(now);

        self.snapshot.timestamp = Epoch::maybe_from_gregorian_utc(
            pvt.year as i32,
            pvt.month,
            pvt.day,
            pvt.hour,
            pvt.min,
            pvt.sec,
            0,
        )
        .map(|t| t + Duration::from_nanoseconds(pvt.nano as f64))
        .map_err(|e| trace!(target: "logger", "invalid receiver time: {}", e))
        .ok();

        self.snapshot.fix = fix;

        if self.snapshot.ttff.is_none()
            && fix == FixQuality::Fix3D
            && self.snapshot.dop.hdop < TTFF_MAX_HDOP
        {
            let ttff = now - self.start;
            info!(target: "logger", "time to first fix: {}", ttff);
            self.snapshot.ttff = Some(ttff);
        }

        self.snapshot.latitude = pvt.lat as f64 * 1.0E-7;
        self.snapshot.longitude = pvt.lon as f64 * 1.0E-7;

        self.snapshot.altitude = if fix == FixQuality::Fix3D {
            pvt.height as f64 / 1000.0
        } else {
            pvt.hmsl as f64 / 1000.0
        };

        self.snapshot.eph = pvt.h_acc as f64 / 1000.0;
        self.snapshot.epv = pvt.v_acc as f64 / 1000.0;

        self.snapshot.heading = pvt.head_mot as f64 * 1.0E-5;
        self.snapshot.speed = pvt.g_speed as f64 / 1000.0;
        Ok(())
    }

    fn update_dop(&mut self, dop: &NavDop) -> Result<(), Error> {
        self.snapshot.dop = Dop {
            gdop: dop.gdop as f64 / 100.0,
            hdop: dop.hdop as f64 / 100.0,
            pdop: dop.pdop as f64 / 100.0,
            tdop: dop.tdop as f64 / 100.0,
            vdop: dop.vdop as f64 / 100.0,
            xdop: dop.edop as f64 / 100.0,
            ydop: dop.ndop as f64 / 100.0,
        };

        self.publish()
    }

    fn update_satellites(&mut self, sat: &NavSat) {
        self.snapshot.satellites = Satellites {
            seen: sat.num_svs as usize,
            used: sat.svs.iter().filter(|sv| sv.is_used()).count(),
        };
    }

    /// Hands an independent copy to each [Sink], in order.
    /// Stops at the first failure, earlier sinks are not rolled back.
    fn publish(&mut self) -> Result<(), Error> {
        for sink in self.sinks.iter_mut() {
            sink.persist(self.snapshot.clone())?;
        }

        debug!(
            target: "logger",
            "published fix={} sats={}/{} hdop={:.2}",
            self.snapshot.fix,
            self.snapshot.satellites.used,
            self.snapshot.satellites.seen,
            self.snapshot.dop.hdop
        );

        Ok(())
    }
}

impl Handler for FixAggregator {
    fn handle(&mut self, msg: &Message) -> Result<(), Error> {
        match msg {
            Message::NavPvt(pvt) => {
                let now = Epoch::now()?;
                self.update_position(pvt, now)
            },
            Message::NavDop(dop) => self.update_dop(dop),
            Message::NavSat(sat) => {
                self.update_satellites(sat);
                Ok(())
            },
            _ => Ok(()),
        }
    }
}
