//! Hardware acceleration discovery, compatibility and selection

pub mod detector;
pub mod device;
pub mod selector;
pub mod validator;

pub use detector::{DetectError, Detector};
pub use device::{HardwareCatalog, HardwareDevice, CPU_CODECS};
pub use selector::{HardwareSelector, SelectionError};
pub use validator::{can_encode, ensure_compatible, supported_codecs, CompatibilityError};
