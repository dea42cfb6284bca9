/// How a property value is encoded on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    /// `"on"` or `"off"`.
    Switch,
    Integer,
    Text,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Switch(bool),
    Integer(i64),
    Text(String),
}

impl Value {
    /// Decode a value the device returned for a property of the given kind.
    ///
    /// `null` and values that do not match the kind decode to `None`.
    pub fn from_json(kind: Kind, json: &serde_json::Value) -> Option<Self> {
        match (kind, json) {
            (Kind::Switch, serde_json::Value::String(s)) => match s.as_str() {
                "on" => Some(Self::Switch(true)),
                "off" => Some(Self::Switch(false)),
                _ => None,
            },
            (Kind::Switch, serde_json::Value::Bool(b)) => Some(Self::Switch(*b)),
            (Kind::Integer, serde_json::Value::Number(n)) => {
                n.as_i64().or_else(|| n.as_f64().map(|f| f.round() as i64)).map(Self::Integer)
            }
            (Kind::Text, serde_json::Value::String(s)) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Switch(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Switch(true) => f.write_str("on"),
            Value::Switch(false) => f.write_str("off"),
            Value::Integer(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl serde::Serialize for Value {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Switch(b) => serializer.serialize_str(if *b { "on" } else { "off" }),
            Value::Integer(n) => serializer.serialize_i64(*n),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyIndex(usize);

impl PropertyIndex {
    pub fn from_name(name: &str) -> Option<PropertyIndex> {
        NAMES.iter().position(|v| *v == name).map(Self)
    }

    pub fn all() -> impl Iterator<Item = PropertyIndex> {
        (0..NAMES.len()).map(Self)
    }

    pub fn name(&self) -> &'static str {
        NAMES[self.0]
    }

    pub fn kind(&self) -> Kind {
        KINDS[self.0]
    }

    pub fn description(&self) -> &'static str {
        DESCRIPTIONS[self.0]
    }
}

// The order here is the order in which the device is read out.
macro_rules! for_each_property {
    ($m:ident) => {
        $m! {
            "power": Switch, "Power state";
            "mode": Text, "Operation mode: automode, cooling, heat, wind or arefaction";
            "st_temp_dec": Integer, "Target temperature, multiplied by 10";
            "temp_dec": Integer, "Current room temperature, multiplied by 10";
            "vertical_swing": Switch, "Vertical swing of the louver";
            "vertical_end": Integer, "Vertical swing end angle: 20, 40 or 60 degrees";
            "vertical_rt": Integer, "Current vertical louver angle, 0 to 60 degrees";
            "speed_level": Integer, "Fan speed: 0 to 4 for level 1 to 5, 5 for auto";
            "lcd_auto": Switch, "Automatic display brightness";
            "lcd_level": Integer, "Display brightness: 0 for off, 1 to 5";
            "volume": Switch, "Beeper on key presses";
            "silent": Switch, "Sleep mode";
            "comfort": Switch, "Comfort mode: cooling at 24 degrees with automatic fan speed";
            "idle_timer": Integer, "Seconds until the device powers off, 0 to 28800";
            "open_timer": Integer, "Seconds until the device powers on";
        }
    };
}

macro_rules! make_lists {
    ($($name: literal: $kind: ident, $description: literal;)+) => {
        pub static NAMES: &[&str] = &[$($name),*];
        pub static KINDS: &[Kind] = &[$(Kind::$kind),*];
        pub static DESCRIPTIONS: &[&str] = &[$($description),*];
    };
}

for_each_property!(make_lists);
