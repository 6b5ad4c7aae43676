mod descriptor;
mod loader;
mod registry;

pub use descriptor::VersionDescriptor;
pub use loader::{load_registry, registry_from_manifest};
pub use registry::VersionRegistry;
