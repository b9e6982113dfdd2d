pub mod index;
pub mod manager;
pub mod schema;
pub mod short_term;
pub mod store;

pub use index::{InMemoryIndex, ScoredMatch, VectorIndex};
pub use manager::{EmbedFn, MemoryManager, MemoryStats};
pub use schema::{MemoryEntry, truncate_str};
pub use short_term::{Note, ShortTermNotes};
pub use store::MemoryStore;
