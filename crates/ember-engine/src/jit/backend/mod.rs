//! Backend-agnostic code generation traits and implementations

pub mod stub;
pub mod traits;

#[cfg(feature = "cranelift")]
pub mod cranelift;

pub use stub::StubBackend;
pub use traits::{CodegenBackend, CodegenError, MachineCode};

#[cfg(feature = "cranelift")]
pub use self::cranelift::CraneliftBackend;
