//! Instruction writers and prologue relocators.
//!
//! Both back ends only emit bytes into caller-provided buffers, so they build
//! (and their encoding tests run) on every host. Executing the output is the
//! interceptor's job and is gated on the matching `target_arch`.

pub mod arm64;
pub mod x86_64;
