//! Static register schema
//!
//! Every exposed quantity appears exactly once. Telemetry lives in the low
//! block (read-only), plant parameters at 100 and up (read-write), followed by
//! the synthetic weather controls. Addresses 11..=99 are reserved and answer
//! with an address error.

use std::collections::BTreeMap;
use strum::{Display, EnumIter, IntoEnumIterator};
use thiserror::Error;

/// Bumped whenever an address, width or scale changes
pub const SCHEMA_VERSION: u16 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Field {
    Status,
    PowerW,
    EnergyWh,
    IrradianceWM2,
    ConsecutiveFailures,
    TickCount,
    RatedTotalW,
    PanelCount,
    RatedCapacityPerPanelW,
    Derate,
    SimulateWeather,
    TickIntervalMs,
    FaultThreshold,
    RunCommand,
    WeatherPhase,
    WeatherDeviation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    /// One 16-bit register
    U16,
    /// Two registers, high word first
    U32,
}

impl Width {
    pub const fn words(self) -> u16 {
        match self {
            Width::U16 => 1,
            Width::U32 => 2,
        }
    }

    pub const fn max_raw(self) -> u32 {
        match self {
            Width::U16 => u16::MAX as u32,
            Width::U32 => u32::MAX,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDef {
    pub address: u16,
    pub field: Field,
    pub width: Width,
    /// Engineering value × scale = raw register value
    pub scale: f64,
    pub access: Access,
}

impl RegisterDef {
    const fn new(address: u16, field: Field, width: Width, scale: f64, access: Access) -> Self {
        Self {
            address,
            field,
            width,
            scale,
            access,
        }
    }

    /// One past the last address occupied by this field
    pub fn end(&self) -> u32 {
        self.address as u32 + self.width.words() as u32
    }
}

use Access::{ReadOnly, ReadWrite};
use Width::{U16, U32};

pub const SCHEMA: &[RegisterDef] = &[
    RegisterDef::new(0, Field::Status, U16, 1.0, ReadOnly),
    RegisterDef::new(1, Field::PowerW, U32, 10.0, ReadOnly),
    RegisterDef::new(3, Field::EnergyWh, U32, 1.0, ReadOnly),
    RegisterDef::new(5, Field::IrradianceWM2, U16, 10.0, ReadOnly),
    RegisterDef::new(6, Field::ConsecutiveFailures, U16, 1.0, ReadOnly),
    RegisterDef::new(7, Field::TickCount, U32, 1.0, ReadOnly),
    RegisterDef::new(9, Field::RatedTotalW, U32, 10.0, ReadOnly),
    RegisterDef::new(100, Field::PanelCount, U16, 1.0, ReadWrite),
    RegisterDef::new(101, Field::RatedCapacityPerPanelW, U32, 10.0, ReadWrite),
    RegisterDef::new(103, Field::Derate, U16, 1000.0, ReadWrite),
    RegisterDef::new(104, Field::SimulateWeather, U16, 1.0, ReadWrite),
    RegisterDef::new(105, Field::TickIntervalMs, U32, 1.0, ReadWrite),
    RegisterDef::new(107, Field::FaultThreshold, U16, 1.0, ReadWrite),
    RegisterDef::new(108, Field::RunCommand, U16, 1.0, ReadWrite),
    RegisterDef::new(109, Field::WeatherPhase, U16, 1.0, ReadWrite),
    RegisterDef::new(110, Field::WeatherDeviation, U16, 1.0, ReadWrite),
];

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("{field} at {address} overlaps {other}")]
    Overlap {
        address: u16,
        field: Field,
        other: Field,
    },
    #[error("{0} is mapped more than once")]
    Duplicate(Field),
    #[error("{0} has no register mapping")]
    Missing(Field),
    #[error("{0} has a non-positive scale factor")]
    BadScale(Field),
    #[error("{0} runs past the end of the address space")]
    PastEnd(Field),
}

/// Location of one protocol address inside a field
#[derive(Debug, Clone, Copy)]
pub struct Slot<'a> {
    pub def: &'a RegisterDef,
    /// 0 for the high (or only) word, 1 for the low word
    pub word: u16,
}

/// Address lookup built once at startup
#[derive(Debug, Clone)]
pub struct RegisterTable {
    defs: Vec<RegisterDef>,
    by_address: BTreeMap<u16, (usize, u16)>,
}

impl RegisterTable {
    /// Build from the compiled-in schema
    pub fn standard() -> Result<Self, SchemaError> {
        Self::build(SCHEMA)
    }

    /// Check that every field is mapped exactly once with no overlapping
    /// addresses, then index by address.
    pub fn build(defs: &[RegisterDef]) -> Result<Self, SchemaError> {
        let mut by_address = BTreeMap::new();
        let mut seen = BTreeMap::new();

        for (index, def) in defs.iter().enumerate() {
            if !(def.scale.is_finite() && def.scale > 0.0) {
                return Err(SchemaError::BadScale(def.field));
            }
            if seen.insert(def.field, index).is_some() {
                return Err(SchemaError::Duplicate(def.field));
            }
            if def.end() > u16::MAX as u32 + 1 {
                return Err(SchemaError::PastEnd(def.field));
            }

            for word in 0..def.width.words() {
                let address = def.address + word;
                if let Some((other, _)) = by_address.insert(address, (index, word)) {
                    return Err(SchemaError::Overlap {
                        address,
                        field: def.field,
                        other: defs[other].field,
                    });
                }
            }
        }

        if let Some(missing) = Field::iter().find(|field| !seen.contains_key(field)) {
            return Err(SchemaError::Missing(missing));
        }

        Ok(Self {
            defs: defs.to_vec(),
            by_address,
        })
    }

    pub fn slot(&self, address: u16) -> Option<Slot<'_>> {
        self.by_address.get(&address).map(|&(index, word)| Slot {
            def: &self.defs[index],
            word,
        })
    }

    pub fn defs(&self) -> &[RegisterDef] {
        &self.defs
    }
}
