//! # chef
//!
//! **Distributed recipe → package build and installation system**
//!
//! This crate implements the cooperating daemons and client tools of the
//! chef system: a container engine used for isolated execution, a
//! crash-recoverable install state machine, and a build orchestration core
//! that routes remote build requests to architecture-matched builders.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                               chef                                   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │   bake ──► waiterd ──► cookd ──► containerv ──► bakectl (in-box)     │
//! │              │  ▲        │            │                              │
//! │              │  └────────┘            │                              │
//! │              │   status/artifacts     │                              │
//! │   serve ──► served ───────────────────┘                              │
//! │              │         (cvd drives the same engine over RPC)         │
//! │              ▼                                                       │
//! │   applications.json + transactions/<id>.{json,log}                   │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  Container Engine (container/)                                       │
//! │    layer composer (layer, pack)  →  composed overlay rootfs          │
//! │    policy engine  (policy/)      →  cgroup-keyed pinned BPF maps,    │
//! │                                     seccomp fallback                 │
//! │    namespace fork + pivot_root + capability drop + readiness         │
//! │    handshake over a datagram socketpair carrying the control fd      │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Subsystems
//!
//! | Module        | Responsibility                                        |
//! |---------------|-------------------------------------------------------|
//! | [`layer`]     | Stack read-only layers + one writable upper into a    |
//! |               | composed rootfs; teardown in reverse mount order      |
//! | [`pack`]      | Verify and stage content packs for the composer       |
//! | [`policy`]    | Compile per-container fs/net rules into the pinned    |
//! |               | policy maps; seccomp fallback without BPF-LSM         |
//! | [`container`] | Create, run, and destroy isolated environments        |
//! | [`install`]   | Persisted install/uninstall/update transactions       |
//! | [`build`]     | Builder queue/pipeline (cookd) and broker (waiterd)   |
//! | [`proto`]     | Newline-delimited JSON control protocol over UDS      |
//!
//! # Lifecycle
//!
//! Containers move `creating → created → running → dying → dead`; the
//! first `spawn` takes created→running, `destroy` drives any non-dead
//! state to dead and is idempotent afterwards. Install transactions move
//! through constant per-type state sets with OK/FAIL successors and
//! survive process restart in their last persisted state.
//!
//! # Platform Support
//!
//! The Linux backend is the real one (namespaces, overlayfs, BPF-LSM or
//! seccomp). The Windows backend is a stub that reports `unsupported` for
//! every operation; platform selection happens once at engine
//! initialization via [`platform::Platform::detect`].

pub mod build;
pub mod constants;
pub mod container;
pub mod error;
pub mod install;
pub mod layer;
pub mod logging;
pub mod pack;
pub mod platform;
pub mod policy;
pub mod proto;

// Re-exports
pub use constants::Paths;
pub use container::{Container, ContainerConfig, ContainerEngine, ContainerStatus, SpawnFlags};
pub use error::{Error, ErrorKind, Result};
pub use layer::{Layer, LayerContext, LayerComposer};
pub use platform::{Arch, ArchMask, Capability, Os, Platform};
pub use policy::{AccessMask, FsRule, NetRule, Policy, SecurityLevel};
