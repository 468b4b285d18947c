use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Element types a tensor can be stored as.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTypeEnum {
    F32,
    F16,
    I32,
    U32,
}

impl DataTypeEnum {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataTypeEnum::F32 => "f32",
            DataTypeEnum::F16 => "f16",
            DataTypeEnum::I32 => "i32",
            DataTypeEnum::U32 => "u32",
        }
    }

    pub fn element_size(&self) -> usize {
        match self {
            DataTypeEnum::F32 => size_of::<f32>(),
            DataTypeEnum::F16 => size_of::<half::f16>(),
            DataTypeEnum::I32 => size_of::<i32>(),
            DataTypeEnum::U32 => size_of::<u32>(),
        }
    }

    /// Reduced precision floats can only be stored on devices with 16 bit storage support.
    pub fn requires_f16_storage(&self) -> bool {
        matches!(self, DataTypeEnum::F16)
    }
}

impl Display for DataTypeEnum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
