pub mod inverter;
pub mod storage;

pub use inverter::{Inverter, Phase, PowerKind, SinglePhaseInverter, ThreePhaseInverter};
pub use storage::StorageUnitSnapshot;
