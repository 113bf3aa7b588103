pub mod backend;
pub mod cli;
pub mod cloudinit;
pub mod config;
pub mod domain_xml;
pub mod error;
pub mod image;
pub mod iso9660;
pub mod naming;
pub mod phase;
pub mod provision;
pub mod storage;
pub mod teardown;
