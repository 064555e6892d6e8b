mod replay;
mod stub;

pub use replay::ReplayBackend;
pub use stub::StubBackend;
