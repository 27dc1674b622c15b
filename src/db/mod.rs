pub mod pool;
pub mod preferences;

pub use pool::create_pool;
pub use preferences::{InMemoryPreferenceStore, PgPreferenceStore, PreferenceDocument, PreferenceStore};
