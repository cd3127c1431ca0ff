//! Per-script isolated runtime provisioning.
//!
//! Each script gets a private directory holding its source, a canonical
//! dependency manifest, an isolated Python runtime and the transcripts of
//! dependency installation. The [`Provisioner`] converges that directory to
//! the script's declared state and reports the actually-installed package
//! versions; provisioning is safe to repeat from any partial state.

mod error;
mod manifest;
mod paths;
mod provisioner;

pub use error::ProvisionError;
pub use manifest::render_manifest;
pub use paths::{
    ScriptPaths, INSTALL_FINISHED, INSTALL_LOG, INSTALL_OK, MANIFEST_FILE, RUNTIME_DIR, SCRIPT_FILE,
};
pub use provisioner::{InstalledPackages, Provisioner};
