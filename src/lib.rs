//! Conclave: end-to-end encrypted group chat.
//!
//! A client library for a group-chat protocol in which confidentiality,
//! integrity and authentication live entirely at the endpoints; the relay
//! only ever sees opaque ciphertext envelopes. The crate also ships the
//! reference gateway (`conclave-gateway`) and a demo bot (`conclave-bot`).

pub mod bex;
pub mod bus;
pub mod conn;
pub mod db;
pub mod gateway;
pub mod multiparty;
pub mod pairwise;
pub mod room;
pub mod transport;
pub mod types;

pub use bex::{BexError, Record};
pub use bus::{Bus, DispatchPolicy};
pub use conn::{Conn, ConnError, Options};
pub use db::{Database, DiskDb, MemoryDb};
pub use multiparty::{Received, Session, SessionError};
pub use pairwise::{PairwiseProvider, PairwiseSession, SmpEvent};
pub use room::{Member, RoomHandle};
pub use transport::ws::TransportKind;
pub use transport::{Frame, FrameError, TransportError};
pub use types::{Event, EventKind, FileRecord};
