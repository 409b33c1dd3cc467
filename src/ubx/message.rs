use ublox::{
    UbxPacket,
    mga_ack::MgaAckRef,
    nav_dop::NavDopRef,
    nav_pvt::proto23::NavPvtRef,
    nav_sat::{NavSatRef, NavSatSvFlags},
    proto23::PacketRef,
};

use super::{CLASS_MGA, Error, ID_MGA_ANO, encode};

/// UBX-NAV-PVT, raw receiver units.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NavPvt {
    pub itow: u32,
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub min: u8,
    pub sec: u8,
    /// fraction of second (ns), may be negative
    pub nano: i32,
    pub fix_type: u8,
    pub num_sv: u8,
    /// 1E-7 deg
    pub lon: i32,
    /// 1E-7 deg
    pub lat: i32,
    /// height above ellipsoid (mm)
    pub height: i32,
    /// height above mean sea level (mm)
    pub hmsl: i32,
    /// horizontal accuracy (mm)
    pub h_acc: u32,
    /// vertical accuracy (mm)
    pub v_acc: u32,
    /// ground speed (mm/s)
    pub g_speed: i32,
    /// heading of motion, 1E-5 deg
    pub head_mot: i32,
}

impl From<&NavPvtRef<'_>> for NavPvt {
    fn from(pvt: &NavPvtRef<'_>) -> Self {
        Self {
            itow: pvt.itow(),
            year: pvt.year(),
            month: pvt.month(),
            day: pvt.day(),
            hour: pvt.hour(),
            min: pvt.min(),
            sec: pvt.sec(),
            nano: pvt.nanosec(),
            fix_type: pvt.fix_type_raw(),
            num_sv: pvt.num_satellites(),
            lon: pvt.longitude_raw(),
            lat: pvt.latitude_raw(),
            height: pvt.height_above_ellipsoid_raw(),
            hmsl: pvt.height_msl_raw(),
            h_acc: pvt.horizontal_accuracy_raw(),
            v_acc: pvt.vertical_accuracy_raw(),
            g_speed: pvt.ground_speed_2d_raw(),
            head_mot: pvt.heading_motion_raw(),
        }
    }
}

/// UBX-NAV-DOP, every value scaled by 100
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NavDop {
    pub itow: u32,
    pub gdop: u16,
    pub pdop: u16,
    pub tdop: u16,
    pub vdop: u16,
    pub hdop: u16,
    pub ndop: u16,
    pub edop: u16,
}

impl From<&NavDopRef<'_>> for NavDop {
    fn from(dop: &NavDopRef<'_>) -> Self {
        Self {
            itow: dop.itow(),
            gdop: dop.geometric_dop_raw(),
            pdop: dop.position_dop_raw(),
            tdop: dop.time_dop_raw(),
            vdop: dop.vertical_dop_raw(),
            hdop: dop.horizontal_dop_raw(),
            ndop: dop.northing_dop_raw(),
            edop: dop.easting_dop_raw(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SatInfo {
    pub gnss_id: u8,
    pub sv_id: u8,
    pub cno: u8,
    pub elev: i8,
    pub azim: i16,
    pub flags: u32,
}

impl SatInfo {
    /// True when this satellite contributes to the navigation solution
    pub fn is_used(&self) -> bool {
        NavSatSvFlags::from(self.flags).sv_used()
    }
}

/// UBX-NAV-SAT
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NavSat {
    pub itow: u32,
    pub num_svs: u8,
    pub svs: Vec<SatInfo>,
}

impl From<&NavSatRef<'_>> for NavSat {
    fn from(sat: &NavSatRef<'_>) -> Self {
        Self {
            itow: sat.itow(),
            num_svs: sat.num_svs(),
            svs: sat
                .svs()
                .map(|sv| SatInfo {
                    gnss_id: sv.gnss_id(),
                    sv_id: sv.sv_id(),
                    cno: sv.cno(),
                    elev: sv.elev(),
                    azim: sv.azim(),
                    flags: sv.flags_raw(),
                })
                .collect(),
        }
    }
}

/// UBX-MGA-ANO: one AssistNow Offline record.
/// The payload is preserved as is, so the record can be re-emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct MgaAno {
    pub sv_id: u8,
    pub gnss_id: u8,
    /// years since 2000
    pub year: u8,
    pub month: u8,
    pub day: u8,
    payload: Vec<u8>,
}

impl MgaAno {
    pub const LEN: usize = 76;

    fn from_payload(p: &[u8]) -> Result<Self, Error> {
        if p.len() != Self::LEN {
            return Err(Error::Payload {
                class: CLASS_MGA,
                id: ID_MGA_ANO,
                len: p.len(),
            });
        }
        Ok(Self {
            sv_id: p[2],
            gnss_id: p[3],
            year: p[4],
            month: p[5],
            day: p[6],
            payload: p.to_vec(),
        })
    }

    /// Builds a record for given satellite and date, with blank orbit data.
    #[cfg(test)]
    pub fn new(gnss_id: u8, sv_id: u8, year: u8, month: u8, day: u8) -> Self {
        let mut payload = vec![0; Self::LEN];
        payload[2] = sv_id;
        payload[3] = gnss_id;
        payload[4] = year;
        payload[5] = month;
        payload[6] = day;
        Self {
            sv_id,
            gnss_id,
            year,
            month,
            day,
            payload,
        }
    }

    /// Re-encodes this record to wire format
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        encode(CLASS_MGA, ID_MGA_ANO, &self.payload)
    }
}

/// UBX-MGA-ACK-DATA0
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MgaAck {
    /// 0: message not used by the receiver, 1: accepted
    pub ack_type: u8,
    pub info_code: u8,
    /// acknowledged MGA message id
    pub msg_id: u8,
}

impl From<&MgaAckRef<'_>> for MgaAck {
    fn from(ack: &MgaAckRef<'_>) -> Self {
        Self {
            ack_type: ack.ack_type(),
            info_code: ack.info_code_raw(),
            msg_id: ack.msg_id(),
        }
    }
}

impl MgaAck {
    pub fn accepted(&self) -> bool {
        self.ack_type == 1
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InfLevel {
    Error,
    Warning,
    Notice,
    Test,
    Debug,
}

/// Every receiver report this application understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    NavPvt(NavPvt),
    NavDop(NavDop),
    NavSat(NavSat),
    MgaAno(MgaAno),
    MgaAck(MgaAck),
    AckAck { class: u8, id: u8 },
    AckNak { class: u8, id: u8 },
    Inf { level: InfLevel, text: String },
    Other { class: u8, id: u8 },
}

/// Discriminant of [Message], used as registration key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    NavPvt,
    NavDop,
    NavSat,
    MgaAno,
    MgaAck,
    AckAck,
    AckNak,
    Inf,
    Other,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::NavPvt(_) => MessageKind::NavPvt,
            Self::NavDop(_) => MessageKind::NavDop,
            Self::NavSat(_) => MessageKind::NavSat,
            Self::MgaAno(_) => MessageKind::MgaAno,
            Self::MgaAck(_) => MessageKind::MgaAck,
            Self::AckAck { .. } => MessageKind::AckAck,
            Self::AckNak { .. } => MessageKind::AckNak,
            Self::Inf { .. } => MessageKind::Inf,
            Self::Other { .. } => MessageKind::Other,
        }
    }

    fn inf(level: InfLevel, text: Option<&str>) -> Self {
        Self::Inf {
            level,
            text: text.unwrap_or_default().trim_end_matches('\0').to_string(),
        }
    }

    /// Interprets a validated [UbxPacket]
    pub fn from_packet(packet: UbxPacket<'_>) -> Result<Self, Error> {
        let UbxPacket::Proto23(packet) = packet;

        let msg = match packet {
            PacketRef::NavPvt(pvt) => Self::NavPvt(NavPvt::from(&pvt)),
            PacketRef::NavDop(dop) => Self::NavDop(NavDop::from(&dop)),
            PacketRef::NavSat(sat) => Self::NavSat(NavSat::from(&sat)),
            PacketRef::MgaAck(ack) => Self::MgaAck(MgaAck::from(&ack)),
            PacketRef::AckAck(ack) => Self::AckAck {
                class: ack.class(),
                id: ack.msg_id(),
            },
            PacketRef::AckNak(nak) => Self::AckNak {
                class: nak.class(),
                id: nak.msg_id(),
            },
            PacketRef::InfError(inf) => Self::inf(InfLevel::Error, inf.message()),
            PacketRef::InfWarning(inf) => Self::inf(InfLevel::Warning, inf.message()),
            PacketRef::InfNotice(inf) => Self::inf(InfLevel::Notice, inf.message()),
            PacketRef::InfTest(inf) => Self::inf(InfLevel::Test, inf.message()),
            PacketRef::InfDebug(inf) => Self::inf(InfLevel::Debug, inf.message()),
            PacketRef::Unknown(unknown)
                if unknown.class == CLASS_MGA && unknown.msg_id == ID_MGA_ANO =>
            {
                Self::MgaAno(MgaAno::from_payload(unknown.payload)?)
            },
            other => {
                let (class, id) = other.class_and_msg_id();
                Self::Other { class, id }
            },
        };

        Ok(msg)
    }
}
