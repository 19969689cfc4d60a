//! User-mode Bluetooth LE host stack.
//!
//! The stack is layered bottom-up: a byte-oriented HCI [`host::Transport`]
//! feeds the [`hci`] packet pump, [`l2cap`] reassembles and fragments PDUs
//! over the LE-U logical link, [`att`] implements the sequential
//! request/response protocol and the attribute database, and [`gatt`] maps
//! services, characteristics, and descriptors onto attributes.

pub mod att;
pub mod dev;
pub mod gatt;
pub mod hci;
pub mod host;
pub mod l2cap;
pub mod uuid;

/// Non-async mutex used for short critical sections that never cross an
/// await point.
pub(crate) type SyncMutex<T> = parking_lot::Mutex<T>;
