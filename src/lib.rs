//! guestbuild: build and test one source tree inside throwaway guest VMs.
//!
//! Each target OS is booted under QEMU, the sources are pushed in over ssh,
//! a fixed configure/build/test pipeline runs in the guest, and the guest is
//! powered off again. The run log left in the target's working directory is
//! classified afterwards: did it build, and did the tests run to the end.

pub mod config;
pub mod logging;
pub mod paths;
pub mod pipeline;
pub mod profiles;
pub mod supervisor;
pub mod vm;
pub mod workflow;
