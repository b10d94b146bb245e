/// Content addressing for the Gearlock engine
///
/// Candidates are identified purely by content hash. Signature schemes
/// and key management are external collaborators; the engine never
/// verifies a signature itself.

pub mod hash;

pub use hash::{hash_data, Hash, HashFunction};
