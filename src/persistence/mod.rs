pub mod store;

pub use store::{FileStateStore, MemoryStateStore, PersistedState, Sequenced, StateStore};
