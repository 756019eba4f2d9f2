//! Table instances and the device registry.
//!
//! A [`TableInstance`] owns everything one table keeps per pipe scope:
//! the handle registry, the entry records, one [`StageInfo`] per stage and
//! the transaction log. Its operations are split by layer:
//!
//! - `instance`: HLP add/modify/delete, transactions, accessors
//! - `placement`: shared and non-shared placement, direct-write programming
//! - `lowlevel`: move-list consumption, warm-restart replay and read-back
//! - `relocate`: relocation chains
//! - `persist`: state walk and restore
//!
//! [`TableRegistry`] holds the instances of every table on a device together
//! with the [`Hardware`] they program, and hands out [`TableSession`]s.
//!
//! [`StageInfo`]: crate::stage::StageInfo

mod hw;
mod instance;
mod lowlevel;
mod persist;
mod placement;
mod registry;
mod relocate;
mod session;

pub use hw::Hardware;
pub use instance::{InstanceConfig, InstanceStats, TableInstance};
pub use registry::{RegistryStats, TableRegistry};
pub use session::TableSession;

#[cfg(test)]
pub(crate) fn recording_hw() -> (Hardware, pipemgr_test::TransportLog) {
    let transport = pipemgr_test::RecordingTransport::new();
    let log = transport.log();
    let hw = Hardware::new(std::sync::Arc::new(pipemgr_test::FakeEncoder), Box::new(transport));
    (hw, log)
}
