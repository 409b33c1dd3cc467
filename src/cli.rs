use clap::{Arg, ArgAction, ArgMatches, ColorChoice, Command, value_parser};
use hifitime::prelude::{Duration, Epoch};

use crate::mga::Settings as UploadSettings;

use std::str::FromStr;

/// Sink selection & retention policy
#[derive(Debug, Clone, Default)]
pub struct SinkSettings {
    /// SQLite database path
    pub database: Option<String>,
    /// Rows older than this are purged
    pub retention: Option<Duration>,
    /// Purge task period
    pub purge_period: std::time::Duration,
    /// JSON lines output ("-" for stdout)
    pub json: Option<String>,
}

/// Assistance upload request
#[derive(Debug, Clone)]
pub struct AssistanceSettings {
    /// AssistNow Offline file
    pub path: String,
    /// Upload every record, regardless of date
    pub upload_all: bool,
    /// Reference day, defaults to today
    pub date: Option<Epoch>,
    pub upload: UploadSettings,
}

pub struct Cli {
    /// Arguments passed by user
    matches: ArgMatches,
}

/// Parses a positive [Duration] like "10 ms" or "1 min"
fn parse_duration(s: &str) -> Result<Duration, String> {
    let duration = Duration::from_str(s.trim()).map_err(|e| format!("invalid duration: {}", e))?;
    if duration.total_nanoseconds() < 0 {
        return Err(format!("negative duration \"{}\"", s));
    }
    Ok(duration)
}

fn parse_epoch(s: &str) -> Result<Epoch, String> {
    Epoch::from_str(s.trim()).map_err(|e| format!("invalid date: {}", e))
}

fn to_std_duration(duration: Duration) -> std::time::Duration {
    std::time::Duration::from_nanos(duration.total_nanoseconds().max(0) as u64)
}

impl Cli {
    /// Build new command line interface
    pub fn new() -> Self {
        Self::from_matches(Self::command().get_matches())
    }

    fn from_matches(matches: ArgMatches) -> Self {
        Self { matches }
    }

    fn command() -> Command {
        Command::new("ubxlog")
            .author("Guillaume W. Bres, <guillaume.bressaix@gmail.com>")
            .version(env!("CARGO_PKG_VERSION"))
            .about("U-Blox position fix logger")
            .color(ColorChoice::Always)
            .arg_required_else_help(true)
            .next_help_heading("Serial port (Active device, GNSS module)")
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .required_unless_present_any(["file"])
                    .help("Define serial port. Example /dev/ttyUSB0 on Linux"),
            )
            .arg(
                Arg::new("baudrate")
                    .short('b')
                    .long("baud")
                    .value_name("Baudrate (u32)")
                    .value_parser(value_parser!(u32))
                    .default_value("115200")
                    .help("Define serial port baud rate. Communications will not work if your U-Blox streams at a different data-rate."),
            )
            .arg(
                Arg::new("no-config")
                    .long("no-config")
                    .action(ArgAction::SetTrue)
                    .help("Do not enable NAV-PVT, NAV-DOP and NAV-SAT output. Use this if your receiver is already configured."),
            )
            .next_help_heading("Replay (Passive mode)")
            .arg(
                Arg::new("file")
                    .short('f')
                    .long("file")
                    .action(ArgAction::Append)
                    .conflicts_with("port")
                    .help("Load UBX stream from file (.gz supported). Files are consumed in the order they were provided."),
            )
            .next_help_heading("Sinks")
            .arg(
                Arg::new("db")
                    .long("db")
                    .value_name("PATH")
                    .help("Store fixes in given SQLite database"),
            )
            .arg(
                Arg::new("retention")
                    .long("retention")
                    .requires("db")
                    .value_parser(parse_duration)
                    .help("Purge database rows older than this. Example: \"7 days\". Rows are kept forever by default."),
            )
            .arg(
                Arg::new("purge-period")
                    .long("purge-period")
                    .value_parser(parse_duration)
                    .default_value("1 min")
                    .help("Database purge period."),
            )
            .arg(
                Arg::new("json")
                    .long("json")
                    .value_name("PATH")
                    .help("Stream fixes as JSON lines to given file, or \"-\" for stdout"),
            )
            .next_help_heading("AssistNow Offline")
            .arg(
                Arg::new("mga-ano")
                    .long("mga-ano")
                    .value_name("PATH")
                    .requires("port")
                    .conflicts_with("file")
                    .help("Upload MGA-ANO records from given file to the receiver"),
            )
            .arg(
                Arg::new("mga-all")
                    .long("mga-all")
                    .action(ArgAction::SetTrue)
                    .requires("mga-ano")
                    .help("Upload all records, not only those of the current day"),
            )
            .arg(
                Arg::new("mga-date")
                    .long("mga-date")
                    .requires("mga-ano")
                    .value_parser(parse_epoch)
                    .help("Reference date for record selection, instead of today. Example: \"2024-06-01T00:00:00 UTC\""),
            )
            .arg(
                Arg::new("mga-pacing")
                    .long("mga-pacing")
                    .value_parser(parse_duration)
                    .default_value("10 ms")
                    .help("Pause after each uploaded record"),
            )
            .arg(
                Arg::new("mga-drain")
                    .long("mga-drain")
                    .value_parser(parse_duration)
                    .default_value("2 s")
                    .help("Pause after the last record, to collect pending acknowledgments"),
            )
    }

    /// Returns User serial port
    pub fn serial_port(&self) -> Option<&String> {
        self.matches.get_one::<String>("port")
    }

    /// Input file paths
    pub fn filepaths(&self) -> Vec<&String> {
        if let Some(fp) = self.matches.get_many::<String>("file") {
            fp.collect()
        } else {
            Vec::new()
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.matches
            .get_one::<u32>("baudrate")
            .copied()
            .unwrap_or(115_200)
    }

    pub fn no_config(&self) -> bool {
        self.matches.get_flag("no-config")
    }

    fn duration(&self, key: &str) -> Option<Duration> {
        self.matches.get_one::<Duration>(key).copied()
    }

    pub fn sink_settings(&self) -> SinkSettings {
        SinkSettings {
            database: self.matches.get_one::<String>("db").cloned(),
            retention: self.duration("retention"),
            purge_period: to_std_duration(
                self.duration("purge-period")
                    .unwrap_or(Duration::from_seconds(60.0)),
            ),
            json: self.matches.get_one::<String>("json").cloned(),
        }
    }

    pub fn assistance_settings(&self) -> Option<AssistanceSettings> {
        let path = self.matches.get_one::<String>("mga-ano")?;

        let mut upload = UploadSettings::default();

        if let Some(pacing) = self.duration("mga-pacing") {
            upload.pacing = to_std_duration(pacing);
        }
        if let Some(drain) = self.duration("mga-drain") {
            upload.drain = to_std_duration(drain);
        }

        Some(AssistanceSettings {
            upload,
            path: path.clone(),
            upload_all: self.matches.get_flag("mga-all"),
            date: self.matches.get_one::<Epoch>("mga-date").copied(),
        })
    }
}
