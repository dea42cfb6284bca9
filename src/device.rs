//! The air conditioner's own vocabulary: raw property reads and single vendor commands.

use crate::connection;
use crate::properties::{PropertyIndex, Value};
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use tracing::{debug, error, info};

pub const ZHIMI_AC_MA1: &str = "zhimi.aircondition.ma1";
pub const MODELS_SUPPORTED: &[&str] = &[ZHIMI_AC_MA1];

/// Something that can carry a single request to the device and bring back its result.
pub trait Rpc: Send + Sync {
    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, connection::Error>> + Send;
}

impl<T: Rpc> Rpc for std::sync::Arc<T> {
    fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> impl Future<Output = Result<serde_json::Value, connection::Error>> + Send {
        T::call(self, method, params)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("`{0}` request failed")]
    Rpc(&'static str, #[source] connection::Error),
    #[error("invalid fan speed {0}, must be between 0 and 5")]
    FanSpeed(u8),
    #[error("invalid display brightness {0}, must be between 0 and 6")]
    LcdLevel(u8),
    #[error("invalid swing angle {0}, must be between 0 and 60")]
    SwingAngle(u8),
    #[error("invalid timer of {0} minutes, must be between 0 and 480")]
    Timer(u16),
    #[error("device info response is missing `{0}`")]
    Info(&'static str),
}

/// Result of a command; the device answers `["ok"]` on success.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult(pub serde_json::Value);

impl CommandResult {
    pub fn is_ok(&self) -> bool {
        self.0 == json!(["ok"])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub model: String,
    pub mac_address: String,
    pub firmware_version: Option<String>,
    pub hardware_version: Option<String>,
}

impl DeviceInfo {
    pub fn unique_id(&self) -> String {
        format!("{}-{}", self.model, self.mac_address)
    }
}

/// A read-out of the device property bag.
///
/// Properties the device did not report are simply absent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AirConditionStatus {
    data: BTreeMap<&'static str, Value>,
}

impl AirConditionStatus {
    pub fn from_values(values: impl IntoIterator<Item = (PropertyIndex, Value)>) -> Self {
        Self { data: values.into_iter().map(|(p, v)| (p.name(), v)).collect() }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.data.get(name)
    }

    pub fn data(&self) -> &BTreeMap<&'static str, Value> {
        &self.data
    }

    fn switch(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    fn integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_i64)
    }

    fn decimal(&self, name: &str) -> Option<f32> {
        self.integer(name).map(|v| v as f32 / 10.0)
    }

    pub fn power(&self) -> Option<bool> {
        self.switch("power")
    }

    /// The raw operation mode string, e.g. `cooling`.
    pub fn mode(&self) -> Option<&str> {
        self.get("mode").and_then(Value::as_str)
    }

    pub fn target_temperature(&self) -> Option<f32> {
        self.decimal("st_temp_dec")
    }

    pub fn temperature(&self) -> Option<f32> {
        self.decimal("temp_dec")
    }

    /// `0` while the swing is off, the swing end angle otherwise.
    pub fn swing_setting(&self) -> Option<i64> {
        match self.switch("vertical_swing")? {
            false => Some(0),
            true => self.integer("vertical_end"),
        }
    }

    pub fn swing_angle(&self) -> Option<i64> {
        self.integer("vertical_rt")
    }

    pub fn fan_speed(&self) -> Option<i64> {
        self.integer("speed_level")
    }

    /// `6` while the brightness is automatic, the brightness level otherwise.
    pub fn lcd_setting(&self) -> Option<i64> {
        match self.switch("lcd_auto") {
            Some(true) => Some(6),
            _ => self.integer("lcd_level"),
        }
    }

    pub fn volume(&self) -> Option<bool> {
        self.switch("volume")
    }

    pub fn sleep(&self) -> Option<bool> {
        self.switch("silent")
    }

    pub fn comfort(&self) -> Option<bool> {
        self.switch("comfort")
    }

    pub fn idle_timer(&self) -> Option<i64> {
        self.integer("idle_timer")
    }

    pub fn open_timer(&self) -> Option<i64> {
        self.integer("open_timer")
    }
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}

pub struct AirCondition<R> {
    rpc: R,
    model: &'static str,
}

impl<R: Rpc> AirCondition<R> {
    pub fn new(rpc: R, model: &str) -> Self {
        let model = match MODELS_SUPPORTED.iter().find(|m| **m == model) {
            Some(m) => *m,
            None => {
                error!(model, fallback = ZHIMI_AC_MA1, "device model unsupported, falling back");
                ZHIMI_AC_MA1
            }
        };
        Self { rpc, model }
    }

    pub fn model(&self) -> &'static str {
        self.model
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    pub fn into_rpc(self) -> R {
        self.rpc
    }

    async fn send(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, Error> {
        self.rpc.call(method, params).await.map_err(|e| Error::Rpc(method, e))
    }

    async fn command(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Result<CommandResult, Error> {
        debug!(method, %params, "sending a command");
        self.send(method, params).await.map(CommandResult)
    }

    pub async fn info(&self) -> Result<DeviceInfo, Error> {
        let info = self.send("miIO.info", json!([])).await?;
        let text = |key: &str| info.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Ok(DeviceInfo {
            model: text("model").ok_or(Error::Info("model"))?,
            mac_address: text("mac").ok_or(Error::Info("mac"))?,
            firmware_version: text("fw_ver"),
            hardware_version: text("hw_ver"),
        })
    }

    /// Read every known property.
    ///
    /// The device only answers a single property per request, so this issues one `get_prop` per
    /// property.
    pub async fn status(&self) -> Result<AirConditionStatus, Error> {
        let mut values = Vec::with_capacity(crate::properties::NAMES.len());
        for property in PropertyIndex::all() {
            let result = self.send("get_prop", json!([property.name()])).await?;
            match result {
                serde_json::Value::Array(items) => values.extend(items),
                other => values.push(other),
            }
            debug!(property = property.name(), ?values, "read a property");
        }
        let properties_count = crate::properties::NAMES.len();
        if values.len() != properties_count {
            info!(
                properties_count,
                values_count = values.len(),
                "count of requested properties does not match the count of received values"
            );
        }
        let decoded = PropertyIndex::all()
            .zip(values.iter())
            .filter_map(|(p, json)| Some((p, Value::from_json(p.kind(), json)?)));
        Ok(AirConditionStatus::from_values(decoded))
    }

    pub async fn on(&self) -> Result<CommandResult, Error> {
        self.command("set_power", json!(["on"])).await
    }

    pub async fn off(&self) -> Result<CommandResult, Error> {
        self.command("set_power", json!(["off"])).await
    }

    /// Set the raw operation mode, e.g. `cooling`.
    pub async fn set_mode(&self, mode: &str) -> Result<CommandResult, Error> {
        self.command("set_mode", json!([mode])).await
    }

    pub async fn set_temperature(&self, temperature: f32) -> Result<CommandResult, Error> {
        let decidegrees = (temperature * 10.0).round() as i64;
        self.command("set_temperature", json!([decidegrees])).await
    }

    pub async fn set_fan_speed(&self, fan_speed: u8) -> Result<CommandResult, Error> {
        if fan_speed > 5 {
            return Err(Error::FanSpeed(fan_speed));
        }
        self.command("set_spd_level", json!([fan_speed])).await
    }

    pub async fn set_swing(&self, on: bool) -> Result<CommandResult, Error> {
        self.command("set_vertical", json!([on_off(on)])).await
    }

    pub async fn set_swing_end(&self, end: u8) -> Result<CommandResult, Error> {
        self.command("set_ver_range", json!([0, end])).await
    }

    pub async fn set_volume(&self, on: bool) -> Result<CommandResult, Error> {
        self.command("set_volume_sw", json!([on_off(on)])).await
    }

    pub async fn set_comfort(&self, on: bool) -> Result<CommandResult, Error> {
        self.command("set_comfort", json!([on_off(on)])).await
    }

    pub async fn set_sleep(&self, on: bool) -> Result<CommandResult, Error> {
        self.command("set_silent", json!([on_off(on)])).await
    }

    /// Levels `0` to `5` set the brightness, `6` makes it automatic.
    pub async fn set_lcd_level(&self, level: u8) -> Result<CommandResult, Error> {
        match level {
            6 => self.command("set_lcd_auto", json!(["on"])).await,
            0..=5 => self.command("set_lcd", json!([level])).await,
            _ => Err(Error::LcdLevel(level)),
        }
    }

    pub async fn set_swing_angle(&self, angle: u8) -> Result<CommandResult, Error> {
        if angle > 60 {
            return Err(Error::SwingAngle(angle));
        }
        self.command("set_ver_pos", json!([angle])).await
    }

    pub async fn set_idle_timer(&self, minutes: u16) -> Result<CommandResult, Error> {
        let seconds = timer_seconds(minutes)?;
        self.command("set_idle_timer", json!([seconds])).await
    }

    pub async fn set_open_timer(&self, minutes: u16) -> Result<CommandResult, Error> {
        let seconds = timer_seconds(minutes)?;
        self.command("set_open_timer", json!([seconds])).await
    }
}

fn timer_seconds(minutes: u16) -> Result<u32, Error> {
    if minutes > 480 {
        return Err(Error::Timer(minutes));
    }
    Ok(u32::from(minutes) * 60)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers `get_prop` from a property bag and records every command.
    #[derive(Default)]
    pub(crate) struct FakeRpc {
        pub(crate) properties: Mutex<serde_json::Map<String, serde_json::Value>>,
        pub(crate) calls: Mutex<Vec<(String, serde_json::Value)>>,
        pub(crate) failing: Mutex<Option<&'static str>>,
        pub(crate) refusing: Mutex<Option<&'static str>>,
    }

    impl FakeRpc {
        pub(crate) fn with(properties: serde_json::Value) -> Self {
            let serde_json::Value::Object(properties) = properties else {
                panic!("properties must be an object");
            };
            Self { properties: Mutex::new(properties), ..Default::default() }
        }

        pub(crate) fn commands(&self) -> Vec<(String, serde_json::Value)> {
            let calls = self.calls.lock().unwrap();
            calls.iter().filter(|(m, _)| m != "get_prop").cloned().collect()
        }

        pub(crate) fn fail(&self, method: &'static str) {
            *self.failing.lock().unwrap() = Some(method);
        }

        /// Make the device answer `method` with something other than `["ok"]`.
        pub(crate) fn refuse(&self, method: &'static str) {
            *self.refusing.lock().unwrap() = Some(method);
        }
    }

    impl Rpc for FakeRpc {
        async fn call(
            &self,
            method: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, connection::Error> {
            self.calls.lock().unwrap().push((method.to_string(), params.clone()));
            let failing = *self.failing.lock().unwrap();
            if failing == Some(method) || failing == Some("*") {
                return Err(connection::Error::Timeout { method: method.into(), attempts: 1 });
            }
            if *self.refusing.lock().unwrap() == Some(method) {
                return Ok(json!(["error"]));
            }
            match method {
                "get_prop" => {
                    let name = params[0].as_str().unwrap();
                    let properties = self.properties.lock().unwrap();
                    match properties.get(name) {
                        // An array is taken as the device's raw answer.
                        Some(raw @ serde_json::Value::Array(_)) => Ok(raw.clone()),
                        value => Ok(json!([value.cloned().unwrap_or_default()])),
                    }
                }
                "miIO.info" => Ok(json!({
                    "model": ZHIMI_AC_MA1,
                    "mac": "28:6C:07:00:00:01",
                    "fw_ver": "2.0.7",
                    "hw_ver": "esp32",
                })),
                _ => Ok(json!(["ok"])),
            }
        }
    }

    pub(crate) fn sample() -> serde_json::Value {
        json!({
            "power": "on",
            "mode": "cooling",
            "st_temp_dec": 265,
            "temp_dec": 244,
            "vertical_swing": "on",
            "vertical_end": 60,
            "vertical_rt": 19,
            "speed_level": 5,
            "lcd_auto": "off",
            "lcd_level": 1,
            "volume": "off",
            "silent": "off",
            "comfort": "off",
            "idle_timer": 0,
            "open_timer": 0,
        })
    }

    #[tokio::test]
    async fn status_reads_one_property_per_request() {
        let device = AirCondition::new(FakeRpc::with(sample()), ZHIMI_AC_MA1);
        let status = device.status().await.unwrap();
        let calls = device.rpc().calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 15);
        assert_eq!(calls[0], ("get_prop".to_string(), json!(["power"])));
        assert_eq!(calls[14], ("get_prop".to_string(), json!(["open_timer"])));
        assert_eq!(status.power(), Some(true));
        assert_eq!(status.mode(), Some("cooling"));
        assert_eq!(status.target_temperature(), Some(26.5));
        assert_eq!(status.temperature(), Some(24.4));
        assert_eq!(status.swing_setting(), Some(60));
        assert_eq!(status.swing_angle(), Some(19));
        assert_eq!(status.fan_speed(), Some(5));
        assert_eq!(status.lcd_setting(), Some(1));
        assert_eq!(status.sleep(), Some(false));
    }

    #[tokio::test]
    async fn missing_properties_are_absent() {
        let device = AirCondition::new(FakeRpc::with(json!({"power": "off"})), ZHIMI_AC_MA1);
        let status = device.status().await.unwrap();
        assert_eq!(status.power(), Some(false));
        assert_eq!(status.mode(), None);
        assert_eq!(status.target_temperature(), None);
        assert_eq!(status.data().len(), 1);
    }

    #[tokio::test]
    async fn short_status_answer_pairs_values_in_order() {
        let mut properties = sample();
        properties["mode"] = json!([]);
        let device = AirCondition::new(FakeRpc::with(properties), ZHIMI_AC_MA1);
        let status = device.status().await.unwrap();
        // Values are paired with properties in read order, so everything after `mode` moves up.
        assert_eq!(status.power(), Some(true));
        assert_eq!(status.mode(), None);
        assert_eq!(status.target_temperature(), Some(24.4));
        assert_eq!(status.temperature(), None);
        assert_eq!(status.open_timer(), None);
        assert!(status.get("idle_timer").is_some());
    }

    #[test]
    fn derived_settings() {
        let status = AirConditionStatus::from_values([
            (PropertyIndex::from_name("vertical_swing").unwrap(), Value::Switch(false)),
            (PropertyIndex::from_name("vertical_end").unwrap(), Value::Integer(40)),
            (PropertyIndex::from_name("lcd_auto").unwrap(), Value::Switch(true)),
            (PropertyIndex::from_name("lcd_level").unwrap(), Value::Integer(3)),
        ]);
        assert_eq!(status.swing_setting(), Some(0));
        assert_eq!(status.lcd_setting(), Some(6));
    }

    #[tokio::test]
    async fn commands_encode_one_vendor_tuple() {
        let device = AirCondition::new(FakeRpc::default(), ZHIMI_AC_MA1);
        assert!(device.on().await.unwrap().is_ok());
        device.set_mode("heat").await.unwrap();
        device.set_temperature(26.5).await.unwrap();
        device.set_fan_speed(2).await.unwrap();
        device.set_swing(false).await.unwrap();
        device.set_swing_end(40).await.unwrap();
        device.set_lcd_level(6).await.unwrap();
        device.set_lcd_level(2).await.unwrap();
        device.set_swing_angle(25).await.unwrap();
        device.set_idle_timer(90).await.unwrap();
        device.set_open_timer(1).await.unwrap();
        device.set_sleep(true).await.unwrap();
        assert_eq!(
            device.rpc().commands(),
            vec![
                ("set_power".to_string(), json!(["on"])),
                ("set_mode".to_string(), json!(["heat"])),
                ("set_temperature".to_string(), json!([265])),
                ("set_spd_level".to_string(), json!([2])),
                ("set_vertical".to_string(), json!(["off"])),
                ("set_ver_range".to_string(), json!([0, 40])),
                ("set_lcd_auto".to_string(), json!(["on"])),
                ("set_lcd".to_string(), json!([2])),
                ("set_ver_pos".to_string(), json!([25])),
                ("set_idle_timer".to_string(), json!([5400])),
                ("set_open_timer".to_string(), json!([60])),
                ("set_silent".to_string(), json!(["on"])),
            ]
        );
    }

    #[test]
    fn only_a_lone_ok_is_success() {
        assert!(CommandResult(json!(["ok"])).is_ok());
        assert!(!CommandResult(json!(["error"])).is_ok());
        assert!(!CommandResult(json!(["ok", "extra"])).is_ok());
        assert!(!CommandResult(json!("ok")).is_ok());
    }

    #[tokio::test]
    async fn out_of_range_arguments_are_rejected_locally() {
        let device = AirCondition::new(FakeRpc::default(), ZHIMI_AC_MA1);
        assert!(matches!(device.set_fan_speed(6).await, Err(Error::FanSpeed(6))));
        assert!(matches!(device.set_lcd_level(7).await, Err(Error::LcdLevel(7))));
        assert!(matches!(device.set_swing_angle(61).await, Err(Error::SwingAngle(61))));
        assert!(matches!(device.set_idle_timer(481).await, Err(Error::Timer(481))));
        assert!(device.rpc().commands().is_empty());
    }

    #[tokio::test]
    async fn info_and_model_fallback() {
        let device = AirCondition::new(FakeRpc::default(), "zhimi.aircondition.v1");
        assert_eq!(device.model(), ZHIMI_AC_MA1);
        let info = device.info().await.unwrap();
        assert_eq!(info.unique_id(), "zhimi.aircondition.ma1-28:6C:07:00:00:01");
        assert_eq!(info.firmware_version.as_deref(), Some("2.0.7"));
    }
}
