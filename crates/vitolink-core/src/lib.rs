//! Vitolink - Optolink protocol engines for Viessmann heating controllers
//!
//! Talks to Vitotronic, Vitodens and GWG-era controllers over their optical
//! serial interface (4800 baud, 8E2, half duplex). Three framing dialects are
//! supported, each as a non-blocking state machine the host drives with
//! repeated `poll` calls:
//!
//! - [`optolink::OptolinkKw`] - the KW dialect (Vitotronic KW series)
//! - [`optolink::OptolinkGwg`] - the legacy GWG dialect
//! - [`optolink::OptolinkP300`] - the checksummed P300 session dialect
//!
//! The [`coordinator::Coordinator`] sits on top of any engine and turns a set
//! of registered [`datapoint::Datapoint`]s into a polling loop with verified
//! writes.
//!
//! # Example
//!
//! ```no_run
//! use vitolink_core::coordinator::Coordinator;
//! use vitolink_core::datapoint::Datapoint;
//! use vitolink_core::optolink::{open_port, OptolinkKw};
//! use vitolink_core::time::Millis;
//! use vitolink_core::value::ValueKind;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let port = open_port("/dev/ttyUSB0", None)?;
//! let mut coordinator = Coordinator::new(OptolinkKw::new(port));
//! let temp = coordinator.register_datapoint(
//!     Datapoint::new("boiler_temp", 0x5525, ValueKind::I16).with_div_ratio(10.0),
//! )?;
//!
//! let start = std::time::Instant::now();
//! let now = || Millis(start.elapsed().as_millis() as u32);
//! coordinator.begin(now());
//! coordinator.update()?;
//! loop {
//!     coordinator.poll(now())?;
//!     if let Some(value) = coordinator.value(temp) {
//!         println!("boiler: {value:?}");
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod coordinator;
pub mod datapoint;
pub mod optolink;
pub mod time;
pub mod value;

pub use coordinator::{Coordinator, DatapointHandle};
pub use datapoint::Datapoint;
pub use optolink::{Optolink, OptolinkError, TransferError, TransferEvent};
pub use time::Millis;
pub use value::{Value, ValueKind};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
