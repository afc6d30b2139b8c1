//! # Architecture Abstraction Layer
//!
//! Everything that touches the processor directly: the context switch, the
//! scheduler stack, the tick/alarm source and the MPU. The rest of the crate
//! sees it only through [`Platform`](crate::scheduler::Platform) and the
//! `switch()` entry point.
//!
//! Currently implements the Cortex-M port (ARMv6-M and up, so the assembly
//! sticks to Thumb-1); extensible to other architectures by adding sibling
//! modules.

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m;
