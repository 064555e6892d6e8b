mod backend;
mod backends;
mod result;

pub use backend::{build_backend, DetectorBackend, DetectorSettings};
pub use backends::{ReplayBackend, StubBackend};
pub use result::{retain_allowed, Detection};
