// lib.rs

//! `slbridge-abi` defines the ABI-shaped types shared between the shim and
//! whatever resolves its upward entry points at load time.
//!
//! The shim itself never performs dynamic symbol resolution: that is the
//! job of the host's interposition layer, which is out of scope for this
//! crate. What the shim *does* need, and what lives here, is a stable,
//! `#[repr(C)]`-clean vocabulary for:
//!
//! - the embedded engine's status codes and column type codes, so the
//!   translation and accessor layers can speak the same numbers the host
//!   expects back;
//! - the raw function-pointer shapes of the upward entry points, so a
//!   production adapter can be built from whatever symbol table the host
//!   process exposes, without the core crate knowing how those symbols
//!   were found.
//!
//! Values in this crate carry no behavior. They exist so `slbridge`'s
//! `native` module has something concrete to build a [`NativeEngine`]
//! adapter around.
//!
//! [`NativeEngine`]: ../slbridge/native/trait.NativeEngine.html

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]

mod codes;
mod native;

pub use codes::*;
pub use native::*;
