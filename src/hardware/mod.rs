//! Device families implementing [`crate::controller::TemperatureHardware`].
//!
//! - [`mock`]: deterministic simulated furnace for tests and demos
//! - [`bisynch_furnace`]: controller reached over the framed bisynch protocol
//! - [`bisynch_device`]: device-side simulator of that protocol

pub mod bisynch_device;
pub mod bisynch_furnace;
pub mod mock;

pub use bisynch_device::BisynchDeviceSim;
pub use bisynch_furnace::{BisynchFurnace, BisynchMnemonics};
pub use mock::{FurnaceCall, FurnaceModel, SimulatedFurnace};
