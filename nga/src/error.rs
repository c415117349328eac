use std::fmt;
use std::io;

use nga_vm::{VmError, VmErrorKind};

/// Everything that can go wrong running the host: a VM fault, or an I/O failure the VM itself
/// has no notion of (reading a script file, opening the image override).
#[derive(Debug)]
pub enum HostError {
    Vm(VmError),
    Io(io::Error),
}

impl From<VmError> for HostError {
    fn from(e: VmError) -> Self {
        HostError::Vm(e)
    }
}

impl From<io::Error> for HostError {
    fn from(e: io::Error) -> Self {
        HostError::Io(e)
    }
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HostError::Vm(e) => match &e.kind {
                VmErrorKind::InvalidOpcode { bundle, .. } => {
                    let b0 = bundle & 0xFF;
                    let b1 = (bundle >> 8) & 0xFF;
                    let b2 = (bundle >> 16) & 0xFF;
                    let b3 = (bundle >> 24) & 0xFF;
                    write!(
                        f,
                        "At {}, opcode {}, Instructions: {} {} {} {}",
                        e.ip.unwrap_or(0),
                        bundle,
                        b0,
                        b1,
                        b2,
                        b3
                    )
                }
                kind => write!(f, "vm fault at ip={:?}: {:?}", e.ip, kind),
            },
            HostError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}
