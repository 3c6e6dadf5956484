/*!
# Modbus DevKit - test doubles for the polling engine

Lets the poller be exercised without field hardware or a live API:
- Scripted Modbus devices with session accounting
- A mock collection endpoint that records payloads
- Fleet builders and an end-to-end harness
*/

pub mod collector;
pub mod fixtures;
pub mod scripted;

pub use collector::MockCollector;
pub use fixtures::{device, fleet_file, init_logging, register, scaled_register, TestHarness};
pub use scripted::{ReadRequest, ScriptedConnector, ScriptedDevice};
