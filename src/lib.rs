// Copyright 2023 Adam Greig
// Licensed under the Apache-2.0 and MIT licenses.

//! xmcdap
//!
//! XMC4000 internal flash programming utility using CMSIS-DAP probes.
//!
//! The flash engine in [`xmc4xxx`] works against any [`target::Target`]: the
//! SWD debug link in [`cortexm`] for real hardware, or the simulated device in
//! [`sim`].

pub mod probe;
pub mod dap;
pub mod swd;
pub mod cortexm;
pub mod target;
pub mod xmc4xxx;
pub mod sim;

pub use target::{Target, WorkingArea};
pub use xmc4xxx::{Flash, FlashController, UserLevel};
