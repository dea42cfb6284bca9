//! The climate vocabulary and its 1:1 mapping onto device codes.

pub const SUPPORT_TARGET_TEMPERATURE: u32 = 1;
pub const SUPPORT_FAN_MODE: u32 = 8;
pub const SUPPORT_PRESET_MODE: u32 = 16;
pub const SUPPORT_SWING_MODE: u32 = 32;

pub const SUPPORT_FLAGS: u32 =
    SUPPORT_TARGET_TEMPERATURE | SUPPORT_FAN_MODE | SUPPORT_SWING_MODE | SUPPORT_PRESET_MODE;

macro_rules! string_enum {
    (
        #[impl($($impl:ident),*)]
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal),* $(,)?
        }
    ) => {
        #[derive(
            Clone,
            Copy,
            Debug,
            PartialEq,
            Eq,
            strum::VariantNames,
            strum::FromRepr,
            strum::IntoStaticStr,
            strum::EnumString,
            strum::Display,
        )]
        #[strum(serialize_all = "snake_case")]
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),*
        }

        $($crate::climate::value::string_enum!(@impl $impl for $name);)*
    };
    (@impl TryFromCode for $name:ident) => {
        impl TryFrom<i64> for $name {
            type Error = $crate::climate::Error;
            fn try_from(code: i64) -> Result<Self, Self::Error> {
                u8::try_from(code)
                    .ok()
                    .and_then(Self::from_repr)
                    .ok_or($crate::climate::Error::UnknownCode { kind: stringify!($name), code })
            }
        }
    };
    (@impl Code for $name:ident) => {
        impl $name {
            /// The value the device uses for this variant.
            pub fn code(self) -> u8 {
                self as u8
            }
        }
    };
    (@impl Serialize for $name:ident) => {
        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(<&'static str>::from(self))
            }
        }
    };
}

pub(crate) use string_enum;

string_enum! {
    #[impl(TryFromCode, Code, Serialize)]
    #[repr(u8)]
    pub enum FanMode {
        Low = 0,
        LowMedium = 1,
        Medium = 2,
        MediumHigh = 3,
        High = 4,
        Auto = 5,
    }
}

string_enum! {
    #[impl(TryFromCode, Code, Serialize)]
    #[repr(u8)]
    pub enum SwingMode {
        Off = 0,
        #[strum(serialize = "end_at_20")]
        EndAt20 = 20,
        #[strum(serialize = "end_at_40")]
        EndAt40 = 40,
        #[strum(serialize = "end_at_60")]
        EndAt60 = 60,
    }
}

string_enum! {
    #[impl(TryFromCode, Code, Serialize)]
    #[repr(u8)]
    pub enum LcdBrightness {
        Off = 0,
        Level1 = 1,
        Level2 = 2,
        Level3 = 3,
        Level4 = 4,
        Level5 = 5,
        Auto = 6,
    }
}

/// Operating state as the host sees it.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    strum::VariantNames,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HvacMode {
    Off,
    Cool,
    Heat,
    FanOnly,
    Dry,
}

/// Operating mode as the device reports it in the `mode` property.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, strum::IntoStaticStr, strum::EnumString, strum::Display,
)]
#[strum(serialize_all = "snake_case")]
pub enum OperationMode {
    Automode,
    Cooling,
    Heat,
    Wind,
    Arefaction,
}

impl OperationMode {
    /// The host mode for this device mode; automatic operation has no host counterpart.
    pub fn hvac_mode(self) -> Option<HvacMode> {
        match self {
            OperationMode::Automode => None,
            OperationMode::Cooling => Some(HvacMode::Cool),
            OperationMode::Heat => Some(HvacMode::Heat),
            OperationMode::Wind => Some(HvacMode::FanOnly),
            OperationMode::Arefaction => Some(HvacMode::Dry),
        }
    }
}

impl HvacMode {
    /// The device mode to request for this host mode. Off is a power state, not a mode.
    pub fn operation_mode(self) -> Option<OperationMode> {
        match self {
            HvacMode::Off => None,
            HvacMode::Cool => Some(OperationMode::Cooling),
            HvacMode::Heat => Some(OperationMode::Heat),
            HvacMode::FanOnly => Some(OperationMode::Wind),
            HvacMode::Dry => Some(OperationMode::Arefaction),
        }
    }
}

/// Named behaviour bundles backed by the `comfort` and `silent` device flags.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    serde::Serialize,
    strum::VariantNames,
    strum::IntoStaticStr,
    strum::EnumString,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Preset {
    Comfort,
    Sleep,
    None,
}

impl Preset {
    /// Comfort wins when the device reports both flags.
    pub fn from_flags(comfort: Option<bool>, sleep: Option<bool>) -> Self {
        match (comfort, sleep) {
            (Some(true), _) => Preset::Comfort,
            (_, Some(true)) => Preset::Sleep,
            _ => Preset::None,
        }
    }

    /// The `(comfort, sleep)` flags this preset asks for.
    pub fn flags(self) -> (bool, bool) {
        match self {
            Preset::Comfort => (true, false),
            Preset::Sleep => (false, true),
            Preset::None => (false, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use strum::VariantNames as _;

    #[test]
    fn host_facing_names() {
        assert_eq!(HvacMode::VARIANTS, ["off", "cool", "heat", "fan_only", "dry"]);
        assert_eq!(
            FanMode::VARIANTS,
            ["low", "low_medium", "medium", "medium_high", "high", "auto"]
        );
        assert_eq!(SwingMode::VARIANTS, ["off", "end_at_20", "end_at_40", "end_at_60"]);
        assert_eq!(LcdBrightness::Level3.to_string(), "level3");
        assert_eq!(Preset::VARIANTS, ["comfort", "sleep", "none"]);
        assert_eq!("end_at_40".parse::<SwingMode>().unwrap(), SwingMode::EndAt40);
        assert_eq!(serde_json::to_string(&FanMode::MediumHigh).unwrap(), "\"medium_high\"");
        assert_eq!(serde_json::to_string(&HvacMode::FanOnly).unwrap(), "\"fan_only\"");
    }

    #[rstest]
    #[case(0, Some(SwingMode::Off))]
    #[case(20, Some(SwingMode::EndAt20))]
    #[case(60, Some(SwingMode::EndAt60))]
    #[case(30, None)]
    #[case(-1, None)]
    fn swing_codes(#[case] code: i64, #[case] expected: Option<SwingMode>) {
        assert_eq!(SwingMode::try_from(code).ok(), expected);
    }

    #[rstest]
    #[case("cooling", Some(HvacMode::Cool))]
    #[case("heat", Some(HvacMode::Heat))]
    #[case("wind", Some(HvacMode::FanOnly))]
    #[case("arefaction", Some(HvacMode::Dry))]
    #[case("automode", None)]
    fn device_modes(#[case] device: &str, #[case] expected: Option<HvacMode>) {
        let mode = device.parse::<OperationMode>().unwrap();
        assert_eq!(mode.hvac_mode(), expected);
        if let Some(hvac) = expected {
            assert_eq!(hvac.operation_mode(), Some(mode));
        }
    }

    #[test]
    fn presets_and_flags() {
        assert_eq!(Preset::from_flags(Some(true), Some(true)), Preset::Comfort);
        assert_eq!(Preset::from_flags(Some(false), Some(true)), Preset::Sleep);
        assert_eq!(Preset::from_flags(None, None), Preset::None);
        assert_eq!(Preset::Sleep.flags(), (false, true));
        assert_eq!(FanMode::Auto.code(), 5);
        assert_eq!(SUPPORT_FLAGS, 57);
    }
}
