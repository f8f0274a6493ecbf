//! Wire messages handed to the runtime.
//!
//! These are declared with the `prost` derives directly so the encoded form is
//! stable protobuf, and with `serde` so a definition can be dumped as JSON.
use crate::options::Phase;
use prost::Message;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration, Serialize, Deserialize)]
#[repr(i32)]
pub enum DeviceType {
    Cpu = 0,
    Cuda = 1,
}

/// A named operator/graph argument. Exactly one value field is populated.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct Argument {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, optional, tag = "2")]
    pub f: Option<f32>,
    #[prost(int64, optional, tag = "3")]
    pub i: Option<i64>,
    #[prost(string, optional, tag = "4")]
    pub s: Option<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub blob: Option<Vec<u8>>,
    #[prost(float, repeated, tag = "7")]
    pub floats: Vec<f32>,
    #[prost(int64, repeated, tag = "8")]
    pub ints: Vec<i64>,
    #[prost(string, repeated, tag = "9")]
    pub strings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgumentValue {
    Float(f32),
    Int(i64),
    String(String),
    Blob(Vec<u8>),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
    Strings(Vec<String>),
}

impl From<f32> for ArgumentValue {
    fn from(value: f32) -> Self {
        ArgumentValue::Float(value)
    }
}

impl From<i64> for ArgumentValue {
    fn from(value: i64) -> Self {
        ArgumentValue::Int(value)
    }
}

impl From<&str> for ArgumentValue {
    fn from(value: &str) -> Self {
        ArgumentValue::String(value.to_string())
    }
}

impl From<String> for ArgumentValue {
    fn from(value: String) -> Self {
        ArgumentValue::String(value)
    }
}

impl From<Vec<f32>> for ArgumentValue {
    fn from(value: Vec<f32>) -> Self {
        ArgumentValue::Floats(value)
    }
}

impl From<Vec<i64>> for ArgumentValue {
    fn from(value: Vec<i64>) -> Self {
        ArgumentValue::Ints(value)
    }
}

impl From<Vec<String>> for ArgumentValue {
    fn from(value: Vec<String>) -> Self {
        ArgumentValue::Strings(value)
    }
}

impl Argument {
    pub fn new(name: impl Into<String>, value: impl Into<ArgumentValue>) -> Self {
        let mut arg = Argument {
            name: name.into(),
            ..Default::default()
        };
        match value.into() {
            ArgumentValue::Float(x) => arg.f = Some(x),
            ArgumentValue::Int(x) => arg.i = Some(x),
            ArgumentValue::String(x) => arg.s = Some(x),
            ArgumentValue::Blob(x) => arg.blob = Some(x),
            ArgumentValue::Floats(x) => arg.floats = x,
            ArgumentValue::Ints(x) => arg.ints = x,
            ArgumentValue::Strings(x) => arg.strings = x,
        }
        arg
    }

    pub fn float(name: impl Into<String>, value: f32) -> Self {
        Self::new(name, value)
    }

    pub fn int(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, value)
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, ArgumentValue::String(value.into()))
    }

    pub fn bytes(name: impl Into<String>, value: Vec<u8>) -> Self {
        Self::new(name, ArgumentValue::Blob(value))
    }

    pub fn floats(name: impl Into<String>, value: Vec<f32>) -> Self {
        Self::new(name, value)
    }

    pub fn ints(name: impl Into<String>, value: Vec<i64>) -> Self {
        Self::new(name, value)
    }

    pub fn strings(name: impl Into<String>, value: Vec<String>) -> Self {
        Self::new(name, value)
    }

    /// Typed view of the populated field. Empty repeated fields read as `None`.
    pub fn value(&self) -> Option<ArgumentValue> {
        if let Some(x) = self.f {
            Some(ArgumentValue::Float(x))
        } else if let Some(x) = self.i {
            Some(ArgumentValue::Int(x))
        } else if let Some(x) = &self.s {
            Some(ArgumentValue::String(x.clone()))
        } else if let Some(x) = &self.blob {
            Some(ArgumentValue::Blob(x.clone()))
        } else if !self.floats.is_empty() {
            Some(ArgumentValue::Floats(self.floats.clone()))
        } else if !self.ints.is_empty() {
            Some(ArgumentValue::Ints(self.ints.clone()))
        } else if !self.strings.is_empty() {
            Some(ArgumentValue::Strings(self.strings.clone()))
        } else {
            None
        }
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct OperatorDef {
    #[prost(string, repeated, tag = "1")]
    pub input: Vec<String>,
    #[prost(string, repeated, tag = "2")]
    pub output: Vec<String>,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(string, tag = "4")]
    pub r#type: String,
    #[prost(message, repeated, tag = "6")]
    pub arg: Vec<Argument>,
}

impl OperatorDef {
    pub fn get_arg(&self, name: &str) -> Option<&Argument> {
        self.arg.iter().find(|a| a.name == name)
    }
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct DeviceOption {
    #[prost(enumeration = "DeviceType", tag = "1")]
    pub device_type: i32,
    #[prost(int32, tag = "2")]
    pub device_id: i32,
    #[prost(uint32, tag = "3")]
    pub random_seed: u32,
    #[prost(string, tag = "4")]
    pub engine: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct GradientTarget {
    #[prost(string, tag = "1")]
    pub cost: String,
    #[prost(string, tag = "2")]
    pub wrt: String,
}

#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct UpdateTarget {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, repeated, tag = "3")]
    pub tensor: Vec<String>,
    #[prost(message, repeated, tag = "4")]
    pub arg: Vec<Argument>,
}

impl UpdateTarget {
    pub fn get_arg(&self, name: &str) -> Option<&Argument> {
        self.arg.iter().find(|a| a.name == name)
    }
}

/// The unit registered with the runtime. `op` is in a valid topological order.
#[derive(Clone, PartialEq, prost::Message, Serialize, Deserialize)]
pub struct GraphDef {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, repeated, tag = "2")]
    pub op: Vec<OperatorDef>,
    #[prost(message, optional, tag = "5")]
    pub device_option: Option<DeviceOption>,
    #[prost(message, repeated, tag = "6")]
    pub arg: Vec<Argument>,
    #[prost(string, repeated, tag = "7")]
    pub target: Vec<String>,
    #[prost(message, repeated, tag = "8")]
    pub g_target: Vec<GradientTarget>,
    #[prost(message, repeated, tag = "9")]
    pub u_target: Vec<UpdateTarget>,
    #[prost(bool, tag = "10")]
    pub debug_mode: bool,
    #[prost(bool, tag = "11")]
    pub share_grads: bool,
}

impl GraphDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn get_arg(&self, name: &str) -> Option<&Argument> {
        self.arg.iter().find(|a| a.name == name)
    }

    pub fn phase(&self) -> Option<Phase> {
        self.get_arg("phase")
            .and_then(|a| a.s.as_deref())
            .and_then(|s| s.parse().ok())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, prost::DecodeError> {
        Self::decode(bytes)
    }
}
