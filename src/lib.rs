//! VirtualBox CPI: a BOSH Cloud Provider Interface that drives VBoxManage,
//! locally or on a remote host over SSH.

pub mod config;
pub mod config_drive;
pub mod cpi;
pub mod disk;
pub mod dispatch;
pub mod driver;
pub mod logging;
pub mod network;
pub mod stemcell;
pub mod vm;
