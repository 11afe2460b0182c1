//! Browser port for tabpilot. `CdpTransport` speaks raw DevTools methods
//! over a chromium connection; `CdpDriver` builds the tab-level operations
//! the executor and session registry need on top of it.

pub mod driver;
pub mod error;
pub mod transport;

pub use driver::{CdpDriver, DriverConfig, ProbeEvent, ResponseBody, TabDriver};
pub use error::DriverError;
pub use transport::{CdpTransport, ChromiumTransport, NoopTransport, TransportEvent};
