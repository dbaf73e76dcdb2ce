//! hearth Host Agent Library
//!
//! The host agent supervises one local VM used as a cluster node. It stages
//! the disks, boots the guest through a pluggable backend, wires port forwards
//! into the guest and keeps a heartbeat on disk until it is told to stop.
//!
//! ## Architecture
//!
//! ```text
//! HostAgent
//! ├── DiskProvisioner     (base image + writable disk)
//! ├── CloudInit           (guest configuration disk)
//! ├── Driver              (firecracker | wsl2)
//! ├── SshManager          (keys, client options)
//! ├── ForwardManager      (listeners + bicopy sessions)
//! ├── ControlServer       (local /health socket)
//! └── mapping loop        (router port mappings)
//! ```
//!
//! ## Modules
//!
//! - `instance`: on-disk identity, status derivation and PID heartbeat
//! - `disk`, `download`: image staging
//! - `driver`: hypervisor backends behind one trait
//! - `forward`: rule-driven port forwarding
//! - `agent`: the orchestrator tying it together

pub mod agent;
pub mod cidata;
pub mod config;
pub mod control;
pub mod disk;
pub mod download;
pub mod driver;
pub mod events;
pub mod forward;
pub mod fsutil;
pub mod instance;
pub mod mapping;
pub mod ssh;
