//! facesort-io — Filesystem side of sorting.
//!
//! Decodes images into RGB frames, enumerates image folders and copies
//! matched files into a destination folder.

pub mod copy;
pub mod discovery;
pub mod frame;

pub use copy::{copy_into, ensure_dir, CollisionPolicy, CopyError, CopyOutcome};
pub use discovery::{discover_images, is_image, DiscoveryError, IMAGE_EXTENSIONS};
pub use frame::{Frame, FrameError};
