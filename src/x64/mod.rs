//! x86-64 software half of the HWSW target.
//!
//! - [`lower`]: IR regions to machine instructions over frame slots
//! - [`encoder`]: machine instructions to bytes using iced-x86
//! - [`object`]: ELF relocatable writer
//! - [`listing`]: GAS and symbolic assembly listings

pub mod encoder;
pub mod listing;
pub mod lower;
pub mod object;

pub use encoder::{encode_function, EncodedFunction, EncodingError, X64Encoder};
pub use lower::{MInst, SwFunction, SwProgram};
