//! Concrete `Device` implementations: direct hardware passthrough, the
//! paravirtual vDPDK fast path, and the trait boundary an in-process NIC
//! behavioral model would implement.

pub mod emulated;
pub mod passthrough;
pub mod vdpdk;
