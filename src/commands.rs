use crate::climate::ClimateEntity;
use crate::connection::Connection;

#[derive(thiserror::Error, Debug)]
pub enum SetupError {
    #[error("could not set up the connection to the device")]
    Connect(#[source] crate::connection::Error),
    #[error("could not set up the climate entity")]
    Climate(#[source] crate::climate::Error),
}

/// Connect, identify the device and read it out once.
async fn connect_climate(
    connection: crate::connection::Args,
    climate: &crate::climate::Args,
) -> Result<ClimateEntity<Connection>, SetupError> {
    let connection = Connection::new(connection).await.map_err(SetupError::Connect)?;
    let mut entity =
        ClimateEntity::setup(connection, climate).await.map_err(SetupError::Climate)?;
    entity.update().await;
    Ok(entity)
}

/// Flatten a serialized record into `(field, value)` rows, nested objects as `outer.inner`.
fn flatten(prefix: &str, value: &serde_json::Value, rows: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let key = if prefix.is_empty() { key.clone() } else { format!("{prefix}.{key}") };
                flatten(&key, value, rows);
            }
        }
        serde_json::Value::Array(items) => {
            let items = items.iter().map(display_json).collect::<Vec<_>>();
            rows.push((prefix.to_string(), items.join(", ")));
        }
        other => rows.push((prefix.to_string(), display_json(other))),
    }
}

fn display_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub mod properties {
    use crate::output;
    use crate::properties::{Kind, PropertyIndex};

    /// Search and output the known device properties.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        output: output::Args,
        filter: Option<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not output the properties")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    pub struct PropertySchema {
        pub name: &'static str,
        pub kind: Kind,
        pub description: &'static str,
    }

    impl PropertySchema {
        pub fn all_properties() -> impl Iterator<Item = Self> {
            PropertyIndex::all().map(|p| PropertySchema {
                name: p.name(),
                kind: p.kind(),
                description: p.description(),
            })
        }

        pub fn is_match(&self, pattern: &str) -> bool {
            let pattern = pattern.to_lowercase();
            self.name.contains(&pattern) || self.description.to_lowercase().contains(&pattern)
        }
    }

    pub fn run(args: Args) -> Result<(), Error> {
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(&["Name", "Kind", "Description"]).map_err(Error::Output)?;
        for property in PropertySchema::all_properties() {
            if let Some(pattern) = &args.filter {
                if !property.is_match(pattern) {
                    continue;
                }
            }
            output
                .result(
                    || {
                        vec![
                            property.name.to_string(),
                            property.kind.to_string(),
                            property.description.to_string(),
                        ]
                    },
                    || &property,
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }

}

pub mod status {
    use crate::connection::{self, Connection};
    use crate::device::{self, AirCondition, ZHIMI_AC_MA1};
    use crate::output;
    use crate::properties::PropertyIndex;

    /// Read out the raw device property bag.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not read the device status")]
        Status(#[source] device::Error),
        #[error("could not output the status")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        name: &'static str,
        value: Option<&'a crate::properties::Value>,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let device = AirCondition::new(connection, ZHIMI_AC_MA1);
        let status = device.status().await.map_err(Error::Status)?;
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(&["Name", "Value"]).map_err(Error::Output)?;
        for property in PropertyIndex::all() {
            let value = status.get(property.name());
            output
                .result(
                    || {
                        let value = value.map(|v| v.to_string()).unwrap_or_default();
                        vec![property.name().to_string(), value]
                    },
                    || Record { name: property.name(), value },
                )
                .map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod info {
    use crate::connection::{self, Connection};
    use crate::device::{self, AirCondition, ZHIMI_AC_MA1};
    use crate::output;

    /// Identify the device.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: connection::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the connection to the device")]
        Connect(#[source] connection::Error),
        #[error("could not read the device information")]
        Info(#[source] device::Error),
        #[error("could not serialize the device information")]
        Serialize(#[source] serde_json::Error),
        #[error("could not output the device information")]
        Output(#[source] output::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let connection = Connection::new(args.connection).await.map_err(Error::Connect)?;
        let device = AirCondition::new(connection, ZHIMI_AC_MA1);
        let info = device.info().await.map_err(Error::Info)?;
        let format = args.output.format();
        let mut output = args.output.to_output().map_err(Error::Output)?;
        if format == output::Format::Jsonl {
            output.result(Vec::new, || &info).map_err(Error::Output)?;
            return output.commit().map_err(Error::Output);
        }
        let mut rows = Vec::new();
        let json = serde_json::to_value(&info).map_err(Error::Serialize)?;
        super::flatten("", &json, &mut rows);
        rows.push(("unique_id".into(), info.unique_id()));
        output.table_headers(&["Field", "Value"]).map_err(Error::Output)?;
        for (field, value) in rows {
            output.result(|| vec![field, value], || ()).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod climate {
    use crate::output;

    /// Read the device and show it as a climate entity.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: crate::connection::Args,
        #[clap(flatten)]
        climate: crate::climate::Args,
        #[clap(flatten)]
        output: output::Args,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the climate entity")]
        Setup(#[source] super::SetupError),
        #[error("the air conditioner is unavailable")]
        Unavailable,
        #[error("could not serialize the climate state")]
        Serialize(#[source] serde_json::Error),
        #[error("could not output the climate state")]
        Output(#[source] output::Error),
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let entity = super::connect_climate(args.connection, &args.climate)
            .await
            .map_err(Error::Setup)?;
        if !entity.available() {
            return Err(Error::Unavailable);
        }
        let state = entity.snapshot();
        let format = args.output.format();
        let mut output = args.output.to_output().map_err(Error::Output)?;
        if format == output::Format::Jsonl {
            output.result(Vec::new, || &state).map_err(Error::Output)?;
            return output.commit().map_err(Error::Output);
        }
        let mut rows = Vec::new();
        let json = serde_json::to_value(&state).map_err(Error::Serialize)?;
        super::flatten("", &json, &mut rows);
        output.table_headers(&["Field", "Value"]).map_err(Error::Output)?;
        for (field, value) in rows {
            output.result(|| vec![field, value], || ()).map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}

pub mod set {
    use crate::climate::value::{FanMode, HvacMode, Preset, SwingMode};
    use crate::climate::{
        self, ClimateEntity, DEFAULT_LCD_LEVEL, DEFAULT_SWING_ANGLE, DEFAULT_TIMER_MINUTES, Outcome,
    };
    use crate::device::Rpc;
    use tracing::{info, warn};

    /// Change a setting of the air conditioner.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: crate::connection::Args,
        #[clap(flatten)]
        climate: climate::Args,
        #[command(subcommand)]
        setting: Setting,
    }

    #[derive(clap::ValueEnum, Clone, Copy, Debug)]
    pub enum Switch {
        On,
        Off,
    }

    #[derive(clap::Subcommand, Clone, Debug)]
    pub enum Setting {
        /// Switch the air conditioner on or off.
        Power { state: Switch },
        /// One of off, cool, heat, fan_only or dry.
        HvacMode { mode: HvacMode },
        /// Target temperature in °C.
        Temperature { degrees: f32 },
        /// One of low, low_medium, medium, medium_high, high or auto.
        FanMode { mode: FanMode },
        /// One of off, end_at_20, end_at_40 or end_at_60.
        SwingMode { mode: SwingMode },
        /// One of comfort, sleep or none.
        Preset { preset: Preset },
        /// Beeper on key presses.
        Volume { state: Switch },
        /// Display brightness: 0 is off, 1 to 5 are levels, 6 is automatic.
        Lcd {
            #[arg(default_value_t = DEFAULT_LCD_LEVEL, value_parser = clap::value_parser!(u8).range(0..=6))]
            level: u8,
        },
        /// Louver position in degrees.
        SwingAngle {
            #[arg(default_value_t = DEFAULT_SWING_ANGLE, value_parser = clap::value_parser!(u8).range(0..=60))]
            angle: u8,
        },
        /// Power off after this many minutes.
        IdleTimer {
            #[arg(default_value_t = DEFAULT_TIMER_MINUTES, value_parser = clap::value_parser!(u16).range(0..=480))]
            minutes: u16,
        },
        /// Power on after this many minutes.
        OpenTimer {
            #[arg(default_value_t = DEFAULT_TIMER_MINUTES, value_parser = clap::value_parser!(u16).range(0..=480))]
            minutes: u16,
        },
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the climate entity")]
        Setup(#[source] super::SetupError),
        #[error("could not change the setting")]
        Apply(#[source] climate::Error),
        #[error("the device did not apply the setting ({0})")]
        NotApplied(Outcome),
    }

    pub async fn apply<R: Rpc>(
        entity: &mut ClimateEntity<R>,
        setting: Setting,
    ) -> Result<Outcome, climate::Error> {
        match setting {
            Setting::Power { state: Switch::On } => entity.turn_on().await,
            Setting::Power { state: Switch::Off } => entity.turn_off().await,
            Setting::HvacMode { mode } => entity.set_hvac_mode(mode).await,
            Setting::Temperature { degrees } => entity.set_temperature(degrees).await,
            Setting::FanMode { mode } => entity.set_fan_mode(mode).await,
            Setting::SwingMode { mode } => entity.set_swing_mode(mode).await,
            Setting::Preset { preset } => entity.set_preset_mode(preset).await,
            Setting::Volume { state } => entity.set_volume(matches!(state, Switch::On)).await,
            Setting::Lcd { level } => entity.set_lcd_level(level).await,
            Setting::SwingAngle { angle } => entity.set_swing_angle(angle).await,
            Setting::IdleTimer { minutes } => entity.set_idle_timer(minutes).await,
            Setting::OpenTimer { minutes } => entity.set_open_timer(minutes).await,
        }
    }

    /// Apply the setting and turn anything short of success into an error.
    pub async fn change<R: Rpc>(
        entity: &mut ClimateEntity<R>,
        setting: Setting,
    ) -> Result<(), Error> {
        match apply(entity, setting.clone()).await.map_err(Error::Apply)? {
            Outcome::Done => {
                info!(message = "setting applied", ?setting);
                Ok(())
            }
            Outcome::Ignored => {
                warn!(
                    message = "setting has no effect in the current mode, nothing was sent",
                    ?setting,
                    hvac_mode = ?entity.hvac_mode(),
                );
                Ok(())
            }
            outcome => Err(Error::NotApplied(outcome)),
        }
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let mut entity = super::connect_climate(args.connection, &args.climate)
            .await
            .map_err(Error::Setup)?;
        change(&mut entity, args.setting).await
    }

}

pub mod watch {
    use crate::climate::poll::{self, StateChange};
    use crate::output;
    use futures::StreamExt as _;
    use std::time::SystemTime;
    use tracing::info;

    /// Refresh the climate entity periodically and report what changes.
    #[derive(clap::Parser)]
    pub struct Args {
        #[clap(flatten)]
        connection: crate::connection::Args,
        #[clap(flatten)]
        climate: crate::climate::Args,
        #[clap(flatten)]
        output: output::Args,
        /// How often to refresh the entity.
        #[arg(long, default_value = "60s")]
        scan_interval: humantime::Duration,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum Error {
        #[error("could not set up the climate entity")]
        Setup(#[source] super::SetupError),
        #[error("could not serialize the climate state")]
        Serialize(#[source] serde_json::Error),
        #[error("could not output the changes")]
        Output(#[source] output::Error),
    }

    #[derive(serde::Serialize)]
    struct Record<'a> {
        time: String,
        #[serde(flatten)]
        change: &'a StateChange,
    }

    pub async fn run(args: Args) -> Result<(), Error> {
        let mut entity = super::connect_climate(args.connection, &args.climate)
            .await
            .map_err(Error::Setup)?;
        let format = args.output.format();
        let mut output = args.output.to_output().map_err(Error::Output)?;
        output.table_headers(&["Time", "Field", "Value"]).map_err(Error::Output)?;
        let changes = poll::poll(&mut entity, *args.scan_interval);
        futures::pin_mut!(changes);
        loop {
            let change = tokio::select! {
                change = changes.next() => match change {
                    Some(change) => change,
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => break,
            };
            info!(message = "climate state changed", changed = ?change.changed);
            let time = humantime::format_rfc3339_seconds(SystemTime::now()).to_string();
            if format == output::Format::Jsonl {
                let record = Record { time, change: &change };
                output.result(Vec::new, || &record).map_err(Error::Output)?;
            } else {
                let mut rows = Vec::new();
                let json = serde_json::to_value(&change.state).map_err(Error::Serialize)?;
                super::flatten("", &json, &mut rows);
                for (field, value) in rows {
                    let top_level = field.split('.').next().unwrap_or_default();
                    if change.changed.iter().any(|c| c == top_level) {
                        output
                            .result(|| vec![time.clone(), field, value], || ())
                            .map_err(Error::Output)?;
                    }
                }
            }
            output.flush().map_err(Error::Output)?;
        }
        output.commit().map_err(Error::Output)
    }
}
