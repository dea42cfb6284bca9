//! The air conditioner as a climate entity: host-facing state derived from the device property
//! bag, and host operations turned into vendor commands.

use crate::device::{self, AirCondition, AirConditionStatus, CommandResult, Rpc, ZHIMI_AC_MA1};
use strum::VariantNames as _;
use tracing::{debug, error, info, warn};
use value::{FanMode, HvacMode, LcdBrightness, OperationMode, Preset, SwingMode};

pub mod poll;
pub mod value;

pub const DEFAULT_NAME: &str = "Zhimi Air Condition";
pub const TARGET_TEMPERATURE_STEP: f32 = 0.1;
pub const TEMPERATURE_UNIT: &str = "°C";

pub const DEFAULT_LCD_LEVEL: u8 = 3;
pub const DEFAULT_SWING_ANGLE: u8 = 25;
pub const DEFAULT_TIMER_MINUTES: u16 = 90;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("target temperature {value} is outside of {min}..={max}")]
    TemperatureOutOfRange { value: f32, min: f32, max: f32 },
    #[error("device reported an unknown {kind} code {code}")]
    UnknownCode { kind: &'static str, code: i64 },
    #[error("invalid device command")]
    Device(#[source] device::Error),
    #[error("could not identify the device, it may not be ready yet")]
    NotReady(#[source] device::Error),
}

#[derive(clap::Parser, Clone, Debug)]
#[group(id = "climate::Args")]
pub struct Args {
    /// Name of the climate entity.
    #[arg(long, default_value = DEFAULT_NAME)]
    pub(crate) name: String,

    /// Lowest target temperature that will be accepted, in °C.
    #[arg(long, default_value_t = 16.0)]
    pub(crate) min_temp: f32,

    /// Highest target temperature that will be accepted, in °C.
    #[arg(long, default_value_t = 30.0)]
    pub(crate) max_temp: f32,
}

impl Default for Args {
    fn default() -> Self {
        Self { name: DEFAULT_NAME.into(), min_temp: 16.0, max_temp: 30.0 }
    }
}

/// What became of a host operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Outcome {
    /// The device acknowledged every command with `["ok"]`.
    Done,
    /// The operation does not apply in the current HVAC mode and nothing was sent.
    Ignored,
    /// The device answered with something other than `["ok"]`.
    Rejected,
    /// The request could not be carried out; the entity is now unavailable.
    Failed,
}

impl Outcome {
    /// Keep the first outcome that is not `Done`.
    fn and(self, other: Outcome) -> Outcome {
        match self {
            Outcome::Done => other,
            _ => self,
        }
    }
}

/// Extra state published next to the climate state.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize)]
pub struct Attributes {
    pub ac_model: String,
    pub temperature: Option<f32>,
    /// The device operation mode, or `off` while powered off.
    pub hvac_mode: Option<String>,
    pub swing_angle: Option<i64>,
    pub lcd_setting: Option<LcdBrightness>,
    pub volume: Option<bool>,
    pub idle_timer: Option<i64>,
    pub open_timer: Option<i64>,
}

/// Everything the host gets to see about the entity.
#[derive(Clone, Debug, PartialEq, serde::Serialize)]
pub struct ClimateState {
    pub name: String,
    pub unique_id: Option<String>,
    pub available: bool,
    pub supported_features: u32,
    pub temperature_unit: &'static str,
    pub target_temperature_step: f32,
    pub min_temp: f32,
    pub max_temp: f32,
    pub current_temperature: Option<f32>,
    pub target_temperature: Option<f32>,
    pub hvac_mode: Option<HvacMode>,
    pub hvac_modes: &'static [&'static str],
    pub fan_mode: Option<FanMode>,
    pub fan_modes: &'static [&'static str],
    pub swing_mode: Option<SwingMode>,
    pub swing_modes: &'static [&'static str],
    pub preset_mode: Option<Preset>,
    pub preset_modes: &'static [&'static str],
    pub attributes: Attributes,
}

pub struct ClimateEntity<R> {
    device: AirCondition<R>,
    name: String,
    unique_id: Option<String>,
    min_temp: f32,
    max_temp: f32,
    available: bool,
    power: Option<bool>,
    current_temperature: Option<f32>,
    target_temperature: Option<f32>,
    hvac_mode: Option<HvacMode>,
    last_on_operation: Option<HvacMode>,
    fan_mode: Option<FanMode>,
    swing_mode: Option<SwingMode>,
    preset_mode: Option<Preset>,
    comfort: Option<bool>,
    sleep: Option<bool>,
    attributes: Attributes,
}

impl<R: Rpc> ClimateEntity<R> {
    pub fn new(device: AirCondition<R>, unique_id: Option<String>, args: &Args) -> Self {
        let attributes = Attributes { ac_model: device.model().to_string(), ..Default::default() };
        Self {
            device,
            name: args.name.clone(),
            unique_id,
            min_temp: args.min_temp,
            max_temp: args.max_temp,
            available: false,
            power: None,
            current_temperature: None,
            target_temperature: None,
            hvac_mode: None,
            last_on_operation: None,
            fan_mode: None,
            swing_mode: None,
            preset_mode: None,
            comfort: None,
            sleep: None,
            attributes,
        }
    }

    /// Identify the device and build an entity for it.
    pub async fn setup(rpc: R, args: &Args) -> Result<Self, Error> {
        let probe = AirCondition::new(rpc, ZHIMI_AC_MA1);
        let info = probe.info().await.map_err(Error::NotReady)?;
        info!(
            message = "device identified",
            model = info.model,
            firmware = info.firmware_version.as_deref().unwrap_or("unknown"),
            hardware = info.hardware_version.as_deref().unwrap_or("unknown"),
        );
        let unique_id = info.unique_id();
        let device = AirCondition::new(probe.into_rpc(), &info.model);
        let mut entity = Self::new(device, Some(unique_id), args);
        entity.attributes.ac_model = info.model;
        Ok(entity)
    }

    pub fn device(&self) -> &AirCondition<R> {
        &self.device
    }

    pub fn available(&self) -> bool {
        self.available
    }

    pub fn hvac_mode(&self) -> Option<HvacMode> {
        self.hvac_mode
    }

    /// The mode the device was last seen operating in while powered on. Automatic operation
    /// shows up as `Off`.
    pub fn last_on_operation(&self) -> Option<HvacMode> {
        self.last_on_operation
    }

    pub fn snapshot(&self) -> ClimateState {
        ClimateState {
            name: self.name.clone(),
            unique_id: self.unique_id.clone(),
            available: self.available,
            supported_features: value::SUPPORT_FLAGS,
            temperature_unit: TEMPERATURE_UNIT,
            target_temperature_step: TARGET_TEMPERATURE_STEP,
            min_temp: self.min_temp,
            max_temp: self.max_temp,
            current_temperature: self.current_temperature,
            target_temperature: self.target_temperature,
            hvac_mode: self.hvac_mode,
            hvac_modes: HvacMode::VARIANTS,
            fan_mode: self.fan_mode,
            fan_modes: FanMode::VARIANTS,
            swing_mode: self.swing_mode,
            swing_modes: SwingMode::VARIANTS,
            preset_mode: self.preset_mode,
            preset_modes: Preset::VARIANTS,
            attributes: self.attributes.clone(),
        }
    }

    /// Refresh the entity from the device.
    pub async fn update(&mut self) {
        match self.device.status().await {
            Ok(status) => self.apply_status(&status),
            Err(e) => {
                error!(
                    message = "got an exception while fetching the state",
                    error = &e as &dyn std::error::Error
                );
                self.available = false;
            }
        }
    }

    fn apply_status(&mut self, status: &AirConditionStatus) {
        debug!(message = "got new state", ?status);
        self.available = true;
        self.power = status.power();
        self.hvac_mode = match self.power {
            Some(false) => Some(HvacMode::Off),
            Some(true) => Some(status.mode().and_then(hvac_mode_of).unwrap_or(HvacMode::Off)),
            None => None,
        };
        if self.power == Some(true) {
            self.last_on_operation = self.hvac_mode;
        }
        self.target_temperature = status.target_temperature();
        self.current_temperature = status.temperature();
        self.fan_mode = status.fan_speed().and_then(known_code);
        self.swing_mode = status.swing_setting().and_then(known_code);
        self.comfort = status.comfort();
        self.sleep = status.sleep();
        self.preset_mode = Some(Preset::from_flags(self.comfort, self.sleep));
        self.attributes = Attributes {
            ac_model: std::mem::take(&mut self.attributes.ac_model),
            temperature: self.target_temperature,
            hvac_mode: match self.power {
                Some(false) => Some(HvacMode::Off.to_string()),
                _ => status.mode().map(str::to_string),
            },
            swing_angle: status.swing_angle(),
            lcd_setting: status.lcd_setting().and_then(known_code),
            volume: status.volume(),
            idle_timer: status.idle_timer(),
            open_timer: status.open_timer(),
        };
    }

    /// Every command result passes through here.
    fn finish(
        &mut self,
        failure: &'static str,
        result: Result<CommandResult, device::Error>,
    ) -> Result<Outcome, Error> {
        match result {
            Ok(response) if response.is_ok() => {
                debug!(message = "response received from the device", response = %response.0);
                Ok(Outcome::Done)
            }
            Ok(response) => {
                warn!(message = failure, response = %response.0);
                Ok(Outcome::Rejected)
            }
            Err(e @ device::Error::Rpc(..)) => {
                error!(message = failure, error = &e as &dyn std::error::Error);
                self.available = false;
                Ok(Outcome::Failed)
            }
            Err(e) => Err(Error::Device(e)),
        }
    }

    pub async fn turn_on(&mut self) -> Result<Outcome, Error> {
        let result = self.device.on().await;
        let outcome = self.finish("turning the air conditioner on failed", result)?;
        if outcome == Outcome::Done {
            self.power = Some(true);
        }
        Ok(outcome)
    }

    pub async fn turn_off(&mut self) -> Result<Outcome, Error> {
        let result = self.device.off().await;
        let outcome = self.finish("turning the air conditioner off failed", result)?;
        if outcome == Outcome::Done {
            self.power = Some(false);
            self.hvac_mode = Some(HvacMode::Off);
        }
        Ok(outcome)
    }

    pub async fn set_hvac_mode(&mut self, mode: HvacMode) -> Result<Outcome, Error> {
        let Some(operation) = mode.operation_mode() else {
            return self.turn_off().await;
        };
        if matches!(self.hvac_mode, None | Some(HvacMode::Off)) {
            let outcome = self.turn_on().await?;
            if outcome != Outcome::Done {
                return Ok(outcome);
            }
        }
        self.hvac_mode = Some(mode);
        let result = self.device.set_mode(<&'static str>::from(operation)).await;
        let outcome = self.finish("setting the operation mode failed", result)?;
        if outcome == Outcome::Done {
            self.update().await;
        }
        Ok(outcome)
    }

    pub async fn set_temperature(&mut self, temperature: f32) -> Result<Outcome, Error> {
        if matches!(self.hvac_mode, Some(HvacMode::Off | HvacMode::FanOnly)) {
            debug!(
                message = "target temperature has no effect in this mode",
                hvac_mode = ?self.hvac_mode
            );
            return Ok(Outcome::Ignored);
        }
        if !(self.min_temp..=self.max_temp).contains(&temperature) {
            return Err(Error::TemperatureOutOfRange {
                value: temperature,
                min: self.min_temp,
                max: self.max_temp,
            });
        }
        self.target_temperature = Some(temperature);
        let result = self.device.set_temperature(temperature).await;
        self.finish("setting the target temperature failed", result)
    }

    pub async fn set_fan_mode(&mut self, fan_mode: FanMode) -> Result<Outcome, Error> {
        if self.hvac_mode == Some(HvacMode::Dry) {
            debug!(message = "fan speed cannot be changed while drying");
            return Ok(Outcome::Ignored);
        }
        self.fan_mode = Some(fan_mode);
        let result = self.device.set_fan_speed(fan_mode.code()).await;
        self.finish("setting the fan speed failed", result)
    }

    pub async fn set_swing_mode(&mut self, swing_mode: SwingMode) -> Result<Outcome, Error> {
        let result = self.device.set_swing(swing_mode != SwingMode::Off).await;
        let mut outcome = self.finish("setting the swing mode failed", result)?;
        if swing_mode != SwingMode::Off && outcome == Outcome::Done {
            let result = self.device.set_swing_end(swing_mode.code()).await;
            outcome = self.finish("setting the swing range failed", result)?;
        }
        if outcome == Outcome::Done {
            self.swing_mode = Some(swing_mode);
        }
        Ok(outcome)
    }

    pub async fn set_preset_mode(&mut self, preset: Preset) -> Result<Outcome, Error> {
        let (comfort, sleep) = preset.flags();
        let mut outcome = Outcome::Done;
        // The flag being switched on goes last, so the device never sees both at once.
        if preset == Preset::Sleep {
            outcome = outcome.and(self.set_comfort(comfort).await?);
            outcome = outcome.and(self.set_sleep(sleep).await?);
        } else {
            outcome = outcome.and(self.set_sleep(sleep).await?);
            outcome = outcome.and(self.set_comfort(comfort).await?);
        }
        if outcome == Outcome::Done {
            self.preset_mode = Some(preset);
        }
        Ok(outcome)
    }

    async fn set_comfort(&mut self, on: bool) -> Result<Outcome, Error> {
        if self.comfort == Some(on) {
            return Ok(Outcome::Done);
        }
        let result = self.device.set_comfort(on).await;
        let outcome = self.finish("setting the comfort preset failed", result)?;
        if outcome == Outcome::Done {
            self.comfort = Some(on);
        }
        Ok(outcome)
    }

    async fn set_sleep(&mut self, on: bool) -> Result<Outcome, Error> {
        if self.sleep == Some(on) {
            return Ok(Outcome::Done);
        }
        let result = self.device.set_sleep(on).await;
        let outcome = self.finish("setting the sleep preset failed", result)?;
        if outcome == Outcome::Done {
            self.sleep = Some(on);
        }
        Ok(outcome)
    }

    pub async fn set_volume(&mut self, on: bool) -> Result<Outcome, Error> {
        let result = self.device.set_volume(on).await;
        let outcome = self.finish("switching the beeper failed", result)?;
        if outcome == Outcome::Done {
            self.attributes.volume = Some(on);
        }
        Ok(outcome)
    }

    pub async fn set_lcd_level(&mut self, level: u8) -> Result<Outcome, Error> {
        let result = self.device.set_lcd_level(level).await;
        let outcome = self.finish("setting the display brightness failed", result)?;
        if outcome == Outcome::Done {
            self.attributes.lcd_setting = LcdBrightness::from_repr(level);
        }
        Ok(outcome)
    }

    pub async fn set_swing_angle(&mut self, angle: u8) -> Result<Outcome, Error> {
        let result = self.device.set_swing_angle(angle).await;
        self.finish("setting the louver angle failed", result)
    }

    pub async fn set_idle_timer(&mut self, minutes: u16) -> Result<Outcome, Error> {
        let result = self.device.set_idle_timer(minutes).await;
        self.finish("setting the power-off timer failed", result)
    }

    pub async fn set_open_timer(&mut self, minutes: u16) -> Result<Outcome, Error> {
        let result = self.device.set_open_timer(minutes).await;
        self.finish("setting the power-on timer failed", result)
    }
}

fn hvac_mode_of(mode: &str) -> Option<HvacMode> {
    match mode.parse::<OperationMode>() {
        Ok(operation) => operation.hvac_mode(),
        Err(_) => {
            debug!(message = "unknown operation mode", mode);
            None
        }
    }
}

fn known_code<T: TryFrom<i64, Error = Error>>(code: i64) -> Option<T> {
    T::try_from(code)
        .inspect_err(|e| {
            debug!(message = "ignoring a device value", error = e as &dyn std::error::Error)
        })
        .ok()
}
