//! # sorng-openvpn-supervisor
//!
//! Supervises a single `openvpn` client process and turns its raw
//! stdout/stderr into a typed connection lifecycle.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | **types** | Status enums, error causes, event payloads, error type, binary lookup |
//! | **config** | `SupervisorConfig` – tunables, serde defaults, validation |
//! | **auth** | Credential holder and ephemeral config / auth-file staging |
//! | **classifier** | Output line → status trigger / error cause |
//! | **logging** | Concurrent stdout/stderr readers and the session log buffer |
//! | **events** | Bounded non-blocking log / status / error channels |
//! | **process** | Argument building, spawn, signalling, exit watcher |
//! | **reaper** | Pre-flight termination of stale `openvpn` instances |
//! | **waiter** | Resolves `connect` from the event stream |
//! | **service** | `OpenVpnClient` – public API and state-machine authority |

pub mod openvpn;
